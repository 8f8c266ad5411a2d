//! End-to-end request scenarios.

use super::helpers::{basic_yaml, proxy_url, start_proxy, start_upstream, Reply};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread")]
async fn basic_proxying_with_valid_credentials() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    let response = reqwest::Client::new()
        .get(proxy_url(&server, "asd"))
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Ok.\n");
    assert_eq!(upstream.queries.load(Ordering::SeqCst), 1);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_is_rejected() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    let response = reqwest::Client::new()
        .get(proxy_url(&server, "asd"))
        .basic_auth("default", Some("wrong"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    let body = response.text().await.unwrap();
    assert!(body.contains("invalid username or password for user"), "{body}");
    assert_eq!(upstream.queries.load(Ordering::SeqCst), 0);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_hit_skips_the_upstream() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
server:
  http:
    listen_addr: "127.0.0.1:0"
clusters:
  - name: first
    nodes: ["{addr}"]
    users:
      - name: backend
users:
  - name: default
    password: qwerty
    to_cluster: first
    to_user: backend
    cache: shortterm
caches:
  - name: shortterm
    mode: file_system
    dir: "{dir}"
    max_size: 1048576
    expire: 60s
"#,
        addr = upstream.addr,
        dir = dir.path().display(),
    );
    let server = start_proxy(&yaml).await;
    let client = reqwest::Client::new();
    let url = proxy_url(&server, "SELECT%20123");

    let first = client
        .get(&url)
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.text().await.unwrap(), "Ok.\n");
    assert_eq!(upstream.queries.load(Ordering::SeqCst), 1);

    let second = client
        .get(&url)
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.text().await.unwrap(), "Ok.\n");
    // Served from cache; the upstream was not contacted again.
    assert_eq!(upstream.queries.load(Ordering::SeqCst), 1);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_fires_and_kills_the_remote_query() {
    let upstream = start_upstream(|_| Reply::Hang).await;
    let yaml = format!(
        r#"
server:
  http:
    listen_addr: "127.0.0.1:0"
clusters:
  - name: first
    nodes: ["{addr}"]
    users:
      - name: backend
users:
  - name: default
    password: qwerty
    to_cluster: first
    to_user: backend
    max_execution_time: 100ms
"#,
        addr = upstream.addr,
    );
    let server = start_proxy(&yaml).await;

    let started = Instant::now();
    let response = reqwest::Client::new()
        .get(proxy_url(&server, "SELECT%20SLEEP"))
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 504);
    assert!(started.elapsed() < Duration::from_secs(1));
    let body = response.text().await.unwrap();
    assert!(body.contains("max_execution_time"), "{body}");

    // The kill reaches the backend promptly.
    let kill_deadline = Instant::now() + Duration::from_secs(1);
    while upstream.kills.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < kill_deadline, "kill query never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.stop();
}

fn single_flight_yaml(addr: &str) -> String {
    format!(
        r#"
server:
  http:
    listen_addr: "127.0.0.1:0"
clusters:
  - name: first
    nodes: ["{addr}"]
    users:
      - name: backend
users:
  - name: default
    password: qwerty
    to_cluster: first
    to_user: backend
    max_execution_time: 2s
    cache: flight
caches:
  - name: flight
    mode: memory
    expire: 60s
    grace_time: 160ms
"#
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_identical_queries_coalesce() {
    let upstream =
        start_upstream(|_| Reply::Delayed(Duration::from_millis(100), 200, "success mate")).await;
    let server = start_proxy(&single_flight_yaml(&upstream.addr)).await;
    let client = reqwest::Client::new();
    let url = proxy_url(&server, "SELECT%20SLEEP100");

    let leader = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .get(&url)
                .basic_auth("default", Some("qwerty"))
                .send()
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let follower = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .get(&url)
                .basic_auth("default", Some("qwerty"))
                .send()
                .await
                .unwrap()
        })
    };

    let leader = leader.await.unwrap();
    let follower = follower.await.unwrap();
    assert_eq!(leader.status(), 200);
    assert_eq!(follower.status(), 200);
    assert_eq!(leader.text().await.unwrap(), "success mate");
    assert_eq!(follower.text().await.unwrap(), "success mate");
    // Exactly one upstream execution for both clients.
    assert_eq!(upstream.queries.load(Ordering::SeqCst), 1);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn grace_expiry_returns_request_timeout() {
    let upstream =
        start_upstream(|_| Reply::Delayed(Duration::from_millis(300), 200, "late result")).await;
    let server = start_proxy(&single_flight_yaml(&upstream.addr)).await;
    let client = reqwest::Client::new();
    let url = proxy_url(&server, "SELECT%20SLEEP200");

    let leader = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .get(&url)
                .basic_auth("default", Some("qwerty"))
                .send()
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let follower = client
        .get(&url)
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    // The follower's grace (160 ms) expires well before the leader's
    // ~300 ms execution completes.
    assert_eq!(follower.status(), 408);
    let body = follower.text().await.unwrap();
    assert!(body.contains("no result found during grace time period"), "{body}");

    let leader = leader.await.unwrap();
    assert_eq!(leader.status(), 200);
    assert_eq!(leader.text().await.unwrap(), "late result");
    assert_eq!(upstream.queries.load(Ordering::SeqCst), 1);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_dispatch_retries_on_another_node() {
    let broken = start_upstream(|_| Reply::Status(502, "bad gateway")).await;
    let healthy = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let yaml = format!(
        r#"
server:
  http:
    listen_addr: "127.0.0.1:0"
clusters:
  - name: first
    nodes: ["{broken}", "{healthy}"]
    retry_number: 1
    users:
      - name: backend
users:
  - name: default
    password: qwerty
    to_cluster: first
    to_user: backend
"#,
        broken = broken.addr,
        healthy = healthy.addr,
    );
    let server = start_proxy(&yaml).await;

    let response = reqwest::Client::new()
        .get(proxy_url(&server, "asd"))
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "Ok.\n");
    assert_eq!(broken.queries.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.queries.load(Ordering::SeqCst), 1);

    // The failed node carries exactly one penalty step; the node that
    // answered carries none.
    let penalty_step = palisade_topology::PenaltyConfig::default().size;
    let generation = server.generation();
    for node in generation.clusters["first"].topology.nodes() {
        let authority = node
            .addr()
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        if authority == broken.addr {
            assert_eq!(node.penalty(), penalty_step);
        } else {
            assert_eq!(node.penalty(), 0);
        }
    }
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn network_allow_list_blocks_localhost() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let yaml = format!(
        r#"
server:
  http:
    listen_addr: "127.0.0.1:0"
clusters:
  - name: first
    nodes: ["{addr}"]
    users:
      - name: backend
users:
  - name: default
    password: qwerty
    to_cluster: first
    to_user: backend
    allowed_networks: ["10.0.0.0/8"]
"#,
        addr = upstream.addr,
    );
    let server = start_proxy(&yaml).await;

    let response = reqwest::Client::new()
        .get(proxy_url(&server, "asd"))
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    let body = response.text().await.unwrap();
    assert!(body.contains("user \"default\" is not allowed to access"), "{body}");
    assert_eq!(upstream.queries.load(Ordering::SeqCst), 0);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrency_limit_returns_429() {
    let upstream =
        start_upstream(|_| Reply::Delayed(Duration::from_millis(200), 200, "slow")).await;
    let yaml = format!(
        r#"
server:
  http:
    listen_addr: "127.0.0.1:0"
clusters:
  - name: first
    nodes: ["{addr}"]
    users:
      - name: backend
users:
  - name: default
    password: qwerty
    to_cluster: first
    to_user: backend
    max_concurrent_queries: 1
"#,
        addr = upstream.addr,
    );
    let server = start_proxy(&yaml).await;
    let client = reqwest::Client::new();
    let url = proxy_url(&server, "SELECT%201");

    let slow = {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            client
                .get(&url)
                .basic_auth("default", Some("qwerty"))
                .send()
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rejected = client
        .get(&url)
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 429);
    let body = rejected.text().await.unwrap();
    assert!(body.contains("max_concurrent_queries"), "{body}");

    assert_eq!(slow.await.unwrap().status(), 200);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn url_credentials_are_accepted() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    let url = format!(
        "http://{}/?query=asd&user=default&password=qwerty",
        server.addr()
    );
    let response = reqwest::Client::new().get(url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn clickhouse_headers_are_accepted_and_stripped() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    let response = reqwest::Client::new()
        .get(proxy_url(&server, "asd"))
        .header("X-ClickHouse-User", "default")
        .header("X-ClickHouse-Key", "qwerty")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn non_select_queries_bypass_the_cache() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&single_flight_yaml(&upstream.addr)).await;
    let client = reqwest::Client::new();
    let url = proxy_url(&server, "INSERT%20INTO%20t%20VALUES%20(1)");

    for _ in 0..2 {
        let response = client
            .get(&url)
            .basic_auth("default", Some("qwerty"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    // Both requests reached the backend; nothing was cached.
    assert_eq!(upstream.queries.load(Ordering::SeqCst), 2);
    server.stop();
}
