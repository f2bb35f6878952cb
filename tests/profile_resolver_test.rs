use std::sync::Arc;
use std::time::Duration;
use telemetry_channel::config::ProfileConfig;
use telemetry_channel::profile::{AppIdResolver, ProfileError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resolver(endpoint: String, max_instant_retries: u32) -> Arc<AppIdResolver> {
    Arc::new(
        AppIdResolver::new(&ProfileConfig {
            endpoint,
            max_instant_retries,
            reset_period_secs: 3600,
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn resolves_application_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/profiles/ikey-1/appId"))
        .respond_with(ResponseTemplate::new(200).set_body_string("app-42"))
        .mount(&server)
        .await;

    let resolver = resolver(server.uri(), 3);
    assert_eq!(resolver.fetch_app_id("ikey-1").await.unwrap(), "app-42");
}

#[tokio::test]
async fn concurrent_fetches_for_one_key_share_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/profiles/ikey-1/appId"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("app-42")
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let resolver = resolver(server.uri(), 3);
    let (first, second) = tokio::join!(
        resolver.fetch_app_id("ikey-1"),
        resolver.fetch_app_id("ikey-1")
    );

    assert_eq!(first.unwrap(), "app-42");
    assert_eq!(second.unwrap(), "app-42");
}

#[tokio::test]
async fn different_keys_resolve_independently() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/profiles/ikey-1/appId"))
        .respond_with(ResponseTemplate::new(200).set_body_string("app-1"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/profiles/ikey-2/appId"))
        .respond_with(ResponseTemplate::new(200).set_body_string("app-2"))
        .mount(&server)
        .await;

    let resolver = resolver(server.uri(), 3);
    let (first, second) = tokio::join!(
        resolver.fetch_app_id("ikey-1"),
        resolver.fetch_app_id("ikey-2")
    );

    assert_eq!(first.unwrap(), "app-1");
    assert_eq!(second.unwrap(), "app-2");
}

#[tokio::test]
async fn failing_key_is_refused_after_cap_until_purge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let resolver = resolver(server.uri(), 2);
    assert!(matches!(
        resolver.fetch_app_id("ikey-1").await,
        Err(ProfileError::Request(_))
    ));
    assert!(matches!(
        resolver.fetch_app_id("ikey-1").await,
        Err(ProfileError::Request(_))
    ));

    // Cap reached: refused without touching the backend
    assert!(matches!(
        resolver.fetch_app_id("ikey-1").await,
        Err(ProfileError::RetriesExhausted)
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    // The periodic sweep clears counters; lookups resume
    resolver.purge();
    assert!(matches!(
        resolver.fetch_app_id("ikey-1").await,
        Err(ProfileError::Request(_))
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn empty_application_id_counts_as_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    let resolver = resolver(server.uri(), 1);
    assert!(matches!(
        resolver.fetch_app_id("ikey-1").await,
        Err(ProfileError::EmptyAppId)
    ));
    assert!(matches!(
        resolver.fetch_app_id("ikey-1").await,
        Err(ProfileError::RetriesExhausted)
    ));
}
