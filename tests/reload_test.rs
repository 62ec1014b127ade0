mod common;

use common::{bypass_rule, config_with_rules, proxy_client, proxy_client_with_password, rule, secret_env, TestProxy};
use pc_proxy::filter::{RequestInfo, Verdict};
use pc_proxy_test_support::test_report;
use wiremock::{matchers::any, Mock, MockServer, ResponseTemplate};

async fn upstream() -> MockServer {
    let upstream = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;
    upstream
}

#[tokio::test]
async fn test_reload_swaps_rules_without_restart() {
    let t = test_report!("Applying a new config changes decisions on the live listener");
    let upstream = upstream().await;
    let mut proxy = TestProxy::start(
        config_with_rules(vec![rule("block", "host", r"127\.0\.0\.1")]),
        &secret_env(None),
    )
    .await;
    let addr = proxy.http_addr();
    let client = proxy_client(addr);

    let before = client.get(upstream.uri()).send().await.unwrap();
    t.assert_eq("Blocked before", &before.status().as_u16(), &403u16);

    t.action("Apply config with an allow rule");
    proxy
        .server
        .apply_config(&config_with_rules(vec![rule("allow", "host", r"127\.0\.0\.1")]))
        .unwrap();

    let after = client.get(upstream.uri()).send().await.unwrap();
    t.assert_eq("Allowed after", &after.status().as_u16(), &200u16);
    t.assert_eq("Same listener", &proxy.http_addr(), &addr);
    proxy.stop().await;
}

#[tokio::test]
async fn test_reapplying_config_is_idempotent() {
    let t = test_report!("Applying the same config twice gives the same decisions");
    let config = config_with_rules(vec![
        rule("allow", "host", r"zoom\.us"),
        rule("block", "host", r"example\.com"),
    ]);
    let mut proxy = TestProxy::start(config.clone(), &secret_env(None)).await;

    let zoom = RequestInfo::new("zoom.us", "/", "http://zoom.us/");
    let example = RequestInfo::new("example.com", "/", "http://example.com/");
    let other = RequestInfo::new("other.com", "/", "http://other.com/");

    for round in 1..=2 {
        proxy.server.apply_config(&config).unwrap();
        let authorizer = proxy.server.authorizer();
        t.assert_eq(&format!("zoom #{}", round), &authorizer.authorize(&zoom), &Verdict::Allowed);
        t.assert_eq(&format!("example #{}", round), &authorizer.authorize(&example), &Verdict::Blocked);
        t.assert_eq(&format!("other #{}", round), &authorizer.authorize(&other), &Verdict::NoMatch);
    }
    t.assert_eq("Rule count", &proxy.server.authorizer().policy().engine.rule_count(), &2usize);
    proxy.stop().await;
}

#[tokio::test]
async fn test_reload_rereads_secret_from_environment() {
    let t = test_report!("The bypass password is re-read on every reload");
    let upstream = upstream().await;
    let var = secret_env(Some("first"));
    let config = config_with_rules(vec![bypass_rule("host", r"127\.0\.0\.1")]);
    let mut proxy = TestProxy::start(config.clone(), &var).await;
    let addr = proxy.http_addr();

    t.action("Change the environment and reload");
    std::env::set_var(&var, "second");
    proxy.server.apply_config(&config).unwrap();

    let old = proxy_client_with_password(addr, "first")
        .get(upstream.uri())
        .send()
        .await
        .unwrap();
    t.assert_eq("Old password refused", &old.status().as_u16(), &403u16);

    let new = proxy_client_with_password(addr, "second")
        .get(upstream.uri())
        .send()
        .await
        .unwrap();
    t.assert_eq("New password accepted", &new.status().as_u16(), &200u16);
    proxy.stop().await;
}

#[tokio::test]
async fn test_listen_change_needs_restart() {
    let t = test_report!("A changed listen port leaves the running listener in place");
    let mut proxy = TestProxy::start(config_with_rules(vec![]), &secret_env(None)).await;
    let addr = proxy.http_addr();

    let mut moved = config_with_rules(vec![]);
    moved.listen.port = 1;
    proxy.server.apply_config(&moved).unwrap();

    t.assert_eq("Address unchanged", &proxy.http_addr(), &addr);
    t.assert_eq("New config recorded", &proxy.server.config().listen.port, &1u16);
    proxy.stop().await;
}
