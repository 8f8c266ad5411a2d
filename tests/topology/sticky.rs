//! Sticky-session selection.

use super::active_cluster;

#[tokio::test]
async fn same_session_always_lands_on_one_node() {
    let cluster = active_cluster(2, 3);
    let first = cluster.select_node(Some("session-abc"));
    for _ in 0..20 {
        assert_eq!(cluster.select_node(Some("session-abc")).host(), first.host());
    }
}

#[tokio::test]
async fn different_sessions_spread_over_nodes() {
    let cluster = active_cluster(1, 8);
    let mut hosts = std::collections::HashSet::new();
    for i in 0..64 {
        hosts.insert(cluster.select_node(Some(&format!("session-{i}"))).host().to_string());
    }
    // FNV-1a over 64 ids across 8 nodes reaches more than one node.
    assert!(hosts.len() > 1, "{hosts:?}");
}

#[tokio::test]
async fn sticky_traffic_does_not_disturb_rotation() {
    let cluster = active_cluster(1, 4);

    // A burst of sticky selections first.
    for _ in 0..17 {
        let _ = cluster.select_node(Some("pinned-session"));
    }

    // The rotation for regular traffic still starts from the first
    // node and stays fair.
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(cluster.select_node(None).host().to_string());
    }
    assert_eq!(seen[0], "r0n0");
    let mut sorted = seen.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), 4, "rotation must stay fair: {seen:?}");
}

#[tokio::test]
async fn dead_pinned_node_falls_back_to_healthy_one() {
    let cluster = active_cluster(1, 3);
    let pinned = cluster.select_node(Some("sess"));
    pinned.set_active(false);

    let fallback = cluster.select_node(Some("sess"));
    assert_ne!(fallback.host(), pinned.host());
    assert!(fallback.is_active());
}

#[tokio::test]
async fn empty_session_id_is_not_sticky() {
    let cluster = active_cluster(1, 2);
    let mut hosts = std::collections::HashSet::new();
    for _ in 0..2 {
        hosts.insert(cluster.select_node(Some("")).host().to_string());
    }
    assert_eq!(hosts.len(), 2);
}
