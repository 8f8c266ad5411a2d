//! HTTP surface details: paths, methods, preflight, metrics.

use super::helpers::{basic_yaml, start_proxy, start_upstream, Reply};

#[tokio::test(flavor = "multi_thread")]
async fn options_preflight_advertises_methods() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    let response = reqwest::Client::new()
        .request(
            reqwest::Method::OPTIONS,
            format!("http://{}/", server.addr()),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("allow").unwrap(), "GET,POST");
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_paths_are_bad_requests() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/not-a-thing", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_methods_are_rejected() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    let response = reqwest::Client::new()
        .delete(format!("http://{}/", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn favicon_is_ignored_quietly() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/favicon.ico", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().is_empty());
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn metrics_endpoint_renders_prometheus_text() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;
    let client = reqwest::Client::new();

    // Generate at least one labelled counter first.
    let _ = client
        .get(format!("http://{}/?query=asd", server.addr()))
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();

    let response = client
        .get(format!("http://{}/metrics", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("request_sum_total"), "{body}");
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn metrics_endpoint_honours_its_allow_list() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let yaml = format!(
        r#"
server:
  http:
    listen_addr: "127.0.0.1:0"
  metrics:
    allowed_networks: ["10.0.0.0/8"]
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
"#,
        addr = upstream.addr,
    );
    let server = start_proxy(&yaml).await;

    let response = reqwest::Client::new()
        .get(format!("http://{}/metrics", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn cors_header_is_opt_in() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;

    let plain = start_proxy(&basic_yaml(&upstream.addr)).await;
    let response = reqwest::Client::new()
        .get(format!("http://{}/?query=asd", plain.addr()))
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    assert!(response.headers().get("access-control-allow-origin").is_none());
    plain.stop();

    let yaml = basic_yaml(&upstream.addr).replace(
        "    to_user: backend",
        "    to_user: backend\n    allow_cors: true",
    );
    let cors = start_proxy(&yaml).await;
    let response = reqwest::Client::new()
        .get(format!("http://{}/?query=asd", cors.addr()))
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    cors.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_swaps_users_atomically() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/?query=asd", server.addr());

    let ok = client
        .get(&url)
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    // New generation with a different password.
    let updated = basic_yaml(&upstream.addr).replace("password: qwerty", "password: changed");
    let config = palisade::config::Config::from_yaml(&updated).unwrap();
    server.reload(&config).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    let stale = client
        .get(&url)
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status(), 401);

    let fresh = client
        .get(&url)
        .basic_auth("default", Some("changed"))
        .send()
        .await
        .unwrap();
    assert_eq!(fresh.status(), 200);
    server.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_reload_keeps_the_old_generation() {
    let upstream = start_upstream(|_| Reply::Status(200, "Ok.\n")).await;
    let server = start_proxy(&basic_yaml(&upstream.addr)).await;

    // The YAML parses but validation must reject the dangling
    // reference and leave the running generation untouched.
    let broken = basic_yaml(&upstream.addr).replace("to_cluster: first", "to_cluster: nowhere");
    let parsed: Result<palisade::config::Config, _> =
        palisade::config::Config::from_yaml(&broken);
    assert!(parsed.is_err());

    let response = reqwest::Client::new()
        .get(format!("http://{}/?query=asd", server.addr()))
        .basic_auth("default", Some("qwerty"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    server.stop();
}
