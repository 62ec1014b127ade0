mod common;

use common::{bypass_rule, config_with_rules, raw_exchange, read_head, rule, secret_env, TestProxy};
use pc_proxy_test_support::test_report;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use wiremock::{matchers::any, Mock, MockServer, ResponseTemplate};

async fn upstream() -> MockServer {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string("through the tunnel"))
        .mount(&upstream)
        .await;
    upstream
}

fn connect_request(target: std::net::SocketAddr) -> String {
    format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n")
}

#[tokio::test]
async fn test_allowed_connect_tunnels_bytes() {
    let t = test_report!("An allowed CONNECT opens a raw tunnel to the target");
    let upstream = upstream().await;
    let target = *upstream.address();
    let proxy = TestProxy::start(config_with_rules(vec![]), &secret_env(None)).await;

    let mut stream = TcpStream::connect(proxy.http_addr()).await.unwrap();
    stream
        .write_all(connect_request(target).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    t.assert_contains("Tunnel established", &head, "200");

    t.action("Send an origin-form request through the tunnel");
    let request = format!("GET / HTTP/1.1\r\nHost: {target}\r\nConnection: close\r\n\r\n");
    let response = raw_exchange(&mut stream, &request).await;
    t.assert_contains("Upstream answered", &response, "through the tunnel");
    proxy.stop().await;
}

#[tokio::test]
async fn test_blocked_connect_returns_403() {
    let t = test_report!("A blocked CONNECT is refused before any tunnel opens");
    let upstream = upstream().await;
    let target = *upstream.address();
    let proxy = TestProxy::start(
        config_with_rules(vec![rule("block", "host", &format!(":{}$", target.port()))]),
        &secret_env(None),
    )
    .await;

    let mut stream = TcpStream::connect(proxy.http_addr()).await.unwrap();
    stream
        .write_all(connect_request(target).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    t.assert_contains("Forbidden", &head, "403");
    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_can_be_challenged() {
    let t = test_report!("CONNECT to a bypassable host is challenged with 407");
    let upstream = upstream().await;
    let target = *upstream.address();
    let proxy = TestProxy::start(
        config_with_rules(vec![bypass_rule("host", r"^127\.0\.0\.1")]),
        &secret_env(Some("s3cret")),
    )
    .await;

    let mut stream = TcpStream::connect(proxy.http_addr()).await.unwrap();
    stream
        .write_all(connect_request(target).as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    t.assert_contains("Challenge", &head, "407");
    t.assert_contains(
        "Realm",
        &head.to_ascii_lowercase(),
        "proxy-authenticate: basic realm=",
    );
    proxy.stop().await;
}
