//! End-to-end exchanges through the full proxy against mock HMUX backends.

mod common;

use std::time::Duration;

use common::{spawn_backend, spawn_proxy, Received, Script};
use hmux_proxy::hmux::codes;

#[tokio::test]
async fn forwards_request_and_relays_response() {
    let mut backend = spawn_backend(Script::Respond {
        status: "200",
        headers: vec![("X-Powered-By", "mock"), ("Content-Type", "text/plain; charset=utf-8")],
        body: "hello from the app tier",
    })
    .await;

    let base = spawn_proxy(&[backend.addr]).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/app/page?user=42"))
        .send()
        .await
        .expect("proxy reachable");

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-powered-by"], "mock");
    assert_eq!(response.headers()["content-type"], "text/plain; charset=utf-8");
    assert_eq!(response.text().await.unwrap(), "hello from the app tier");

    // The backend saw the path, the query and the method as separate tuples.
    let received = backend.drain_received();
    assert!(received.contains(&Received::Tuple(codes::HMUX_URI, b"/app/page".to_vec())));
    assert!(received.contains(&Received::Tuple(codes::CSE_QUERY_STRING, b"user=42".to_vec())));
    assert!(received.contains(&Received::Tuple(codes::HMUX_METHOD, b"GET".to_vec())));
    assert!(received.contains(&Received::Control(codes::HMUX_QUIT)));
}

#[tokio::test]
async fn keepalive_connection_is_reused() {
    let backend = spawn_backend(Script::Respond {
        status: "200",
        headers: vec![],
        body: "ok",
    })
    .await;

    let base = spawn_proxy(&[backend.addr]).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response = client.get(format!("{base}/")).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ok");
        // Let the spawned exchange task finish parking the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn post_body_reaches_the_backend() {
    let mut backend = spawn_backend(Script::Respond {
        status: "201",
        headers: vec![],
        body: "stored",
    })
    .await;

    let base = spawn_proxy(&[backend.addr]).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{base}/upload"))
        .body("payload bytes")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 201);
    assert_eq!(response.text().await.unwrap(), "stored");

    let received = backend.drain_received();
    assert!(received.contains(&Received::Tuple(codes::HMUX_DATA, b"payload bytes".to_vec())));
}

#[tokio::test]
async fn busy_backend_fails_over_without_leaking_its_body() {
    let busy = spawn_backend(Script::Busy).await;
    let healthy = spawn_backend(Script::Respond {
        status: "200",
        headers: vec![],
        body: "served by the survivor",
    })
    .await;

    let base = spawn_proxy(&[busy.addr, healthy.addr]).await;
    let client = reqwest::Client::new();

    // Round-robin starts at the busy backend; every request must still land.
    for _ in 0..4 {
        let response = client.get(format!("{base}/")).send().await.unwrap();
        assert_eq!(response.status(), 200);

        let body = response.text().await.unwrap();
        assert_eq!(body, "served by the survivor");
        assert!(!body.contains("try again later"));
    }
}

#[tokio::test]
async fn streamed_body_gets_the_backend_503_instead_of_the_static_page() {
    let backend = spawn_backend(Script::Busy).await;

    let base = spawn_proxy(&[backend.addr]).await;
    let client = reqwest::Client::new();

    // Larger than the buffered prefix, so the body cannot be replayed and a
    // busy backend's own response must reach the client.
    let body = vec![b'x'; 64 * 1024];
    let response = client.post(format!("{base}/upload")).body(body).send().await.unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "try again later");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn every_backend_busy_stops_after_two_attempts() {
    let a = spawn_backend(Script::Busy).await;
    let b = spawn_backend(Script::Busy).await;

    let base = spawn_proxy(&[a.addr, b.addr]).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/")).send().await.unwrap();

    // The failover attempt does not treat 503 as retryable, so the second
    // backend's own response is what the client sees.
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), "try again later");

    // Exactly one attempt per backend, never a third.
    assert_eq!(a.connection_count() + b.connection_count(), 2);
}

#[tokio::test]
async fn unreachable_backends_yield_the_static_page() {
    let addrs: Vec<std::net::SocketAddr> =
        vec!["127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap()];

    let base = spawn_proxy(&addrs).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/")).send().await.unwrap();
    assert_eq!(response.status(), 503);
    assert!(response
        .text()
        .await
        .unwrap()
        .contains("503 Service Temporarily Unavailable"));
}

#[tokio::test]
async fn hangup_backend_fails_over_for_gets() {
    let flaky = spawn_backend(Script::Hangup).await;
    let healthy = spawn_backend(Script::Respond {
        status: "200",
        headers: vec![],
        body: "recovered",
    })
    .await;

    let base = spawn_proxy(&[flaky.addr, healthy.addr]).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "recovered");
}

#[tokio::test]
async fn sticky_session_cookie_pins_the_backend() {
    let first = spawn_backend(Script::Respond {
        status: "200",
        headers: vec![],
        body: "backend a",
    })
    .await;
    let second = spawn_backend(Script::Respond {
        status: "200",
        headers: vec![],
        body: "backend b",
    })
    .await;

    let base = spawn_proxy(&[first.addr, second.addr]).await;
    let client = reqwest::Client::new();

    // 'b' encodes backend index 1 in the session id.
    for _ in 0..4 {
        let response = client
            .get(format!("{base}/app"))
            .header("Cookie", "JSESSIONID=bXQpUCfA")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "backend b");
    }

    assert_eq!(first.connection_count(), 0);
}

#[tokio::test]
async fn status_page_lists_backends() {
    let backend = spawn_backend(Script::Respond {
        status: "200",
        headers: vec![],
        body: "ok",
    })
    .await;

    let base = spawn_proxy(&[backend.addr]).await;
    let client = reqwest::Client::new();

    let response = client.get(format!("{base}/hmux-status")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    assert!(body.contains("Status : Hyper HMUX Connector"));
    assert!(body.contains(&backend.addr.to_string()));
}
