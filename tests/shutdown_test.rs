mod common;

use common::{absolute_get, config_with_rules, read_head, secret_env, TestCert, TestProxy};
use pc_proxy::{Error, ProxyServer, ServerState};
use pc_proxy_test_support::test_report;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use wiremock::{matchers::any, Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_stop_closes_both_listeners() {
    let t = test_report!("Stop drains HTTP and HTTPS listeners and reports no errors");
    let cert = TestCert::generate();
    let mut config = config_with_rules(vec![]);
    cert.enable_in(&mut config);

    let mut proxy = TestProxy::start(config, &secret_env(None)).await;
    let http = proxy.http_addr();
    let https = proxy.https_addr();

    let errors = proxy.server.stop().await;
    t.assert_true("No shutdown errors", errors.is_empty());
    t.assert_eq("State", &proxy.server.state(), &ServerState::Stopped);

    t.assert_true("HTTP closed", TcpStream::connect(http).await.is_err());
    t.assert_true("HTTPS closed", TcpStream::connect(https).await.is_err());
}

#[tokio::test]
async fn test_idle_keepalive_connection_does_not_hold_shutdown() {
    let t = test_report!("An idle keep-alive connection is closed gracefully on stop");
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let server = ProxyServer::new(config_with_rules(vec![]))
        .with_secret_env(secret_env(None))
        .with_shutdown_timeout(Duration::from_secs(5));
    let mut proxy = TestProxy::start_server(server).await;

    t.action("Open a keep-alive connection and complete one request");
    let mut stream = TcpStream::connect(proxy.http_addr()).await.unwrap();
    let target = *upstream.address();
    let request = absolute_get(target, "/").replace("Connection: close", "Connection: keep-alive");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await;
    t.assert_contains("First response", &head, "200");

    let started = Instant::now();
    let errors = proxy.server.stop().await;
    t.assert_true("No shutdown errors", errors.is_empty());
    t.assert_true("Did not wait for the timeout", started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_stop_reports_listener_that_does_not_drain() {
    let t = test_report!("A listener stuck on an in-flight request times out with an error");
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&upstream)
        .await;

    let timeout = Duration::from_millis(500);
    let server = ProxyServer::new(config_with_rules(vec![]))
        .with_secret_env(secret_env(None))
        .with_shutdown_timeout(timeout);
    let mut proxy = TestProxy::start_server(server).await;

    t.action("Send a request the upstream holds for 30s, then stop");
    let mut stream = TcpStream::connect(proxy.http_addr()).await.unwrap();
    let request = absolute_get(*upstream.address(), "/slow");
    stream.write_all(request.as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let errors = proxy.server.stop().await;
    let elapsed = started.elapsed();

    t.assert_eq("One error", &errors.len(), &1usize);
    t.assert_true(
        "HTTP listener timed out",
        matches!(
            errors.as_slice(),
            [Error::ShutdownTimeout { listener: "http", timeout: reported }] if *reported == timeout
        ),
    );
    t.assert_true("Waited for the timeout", elapsed >= timeout);
    t.assert_true("Did not hang", elapsed < Duration::from_secs(5));
}
