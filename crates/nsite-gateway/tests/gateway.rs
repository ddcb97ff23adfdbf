mod support;

use axum::http::StatusCode;
use nsite_gateway::{invalidation, server, RELAY_LIST_KIND, SERVER_LIST_KIND};
use relay_client::{Event, Pubkey};
use site_cache::{CachedValue, Namespace};
use std::sync::atomic::Ordering;
use support::*;
use tower::ServiceExt;

async fn get(
    router: &axum::Router,
    host: &str,
    path: &str,
    if_none_match: Option<&str>,
) -> axum::response::Response {
    let mut request = hyper::Request::builder().uri(path).header("host", host);
    if let Some(etag) = if_none_match {
        request = request.header("if-none-match", etag);
    }
    router
        .clone()
        .oneshot(request.body(hyper::Body::empty()).unwrap())
        .await
        .unwrap()
}

fn header<'a>(response: &'a axum::response::Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .map(|value| value.to_str().unwrap())
        .unwrap_or_default()
}

#[tokio::test]
async fn serves_a_published_site() {
    let pubkey = Pubkey::from_bytes([1u8; 32]);
    let body = b"<!doctype html><html><body>hello</body></html>".to_vec();
    let hash = sha256_hex(&body);

    let relay = spawn_relay(vec![mapping_event(&pubkey.to_hex(), "/index.html", &hash, 100)]).await;
    let blob = spawn_blob_server(StatusCode::OK, body.clone(), "text/html").await;
    let app = test_app(vec![relay.url.clone()], vec![blob.url.clone()]).await;
    let router = server::build_router(app.clone());

    let host = format!("{}.localhost", pubkey.to_npub());
    let response = get(&router, &host, "/", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "etag"), format!("\"{hash}\""));
    assert_eq!(header(&response, "x-content-sha256"), hash);
    assert_eq!(header(&response, "content-type"), "text/html");
    assert_eq!(header(&response, "cache-control"), "public, max-age=3600");
    assert_eq!(header(&response, "content-length"), body.len().to_string());

    let served = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&served[..], &body[..]);
}

#[tokio::test]
async fn matching_if_none_match_returns_304_without_body() {
    let pubkey = Pubkey::from_bytes([2u8; 32]);
    let body = b"<html></html>".to_vec();
    let hash = sha256_hex(&body);

    let relay = spawn_relay(vec![mapping_event(&pubkey.to_hex(), "/index.html", &hash, 1)]).await;
    let blob = spawn_blob_server(StatusCode::OK, body, "text/html").await;
    let app = test_app(vec![relay.url.clone()], vec![blob.url.clone()]).await;
    let router = server::build_router(app.clone());
    let host = format!("{}.localhost", pubkey.to_npub());

    let etag = format!("\"{hash}\"");
    let response = get(&router, &host, "/", Some(&etag)).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header(&response, "etag"), etag);
    let served = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(served.is_empty());
    // The revalidation never touched a blob server.
    assert_eq!(blob.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_path_falls_back_to_not_found_page() {
    let pubkey = Pubkey::from_bytes([3u8; 32]);
    let body = b"<html>gone</html>".to_vec();
    let hash = sha256_hex(&body);

    // Only /404.html is published.
    let relay = spawn_relay(vec![mapping_event(&pubkey.to_hex(), "/404.html", &hash, 1)]).await;
    let blob = spawn_blob_server(StatusCode::OK, body.clone(), "text/html").await;
    let app = test_app(vec![relay.url.clone()], vec![blob.url.clone()]).await;
    let router = server::build_router(app.clone());
    let host = format!("{}.localhost", pubkey.to_npub());

    let response = get(&router, &host, "/missing", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-content-sha256"), hash);
    let served = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&served[..], &body[..]);
}

#[tokio::test]
async fn blob_fetch_fails_over_between_servers() {
    let body = b"payload".to_vec();
    let hash = sha256_hex(&body);

    let broken = spawn_blob_server(StatusCode::INTERNAL_SERVER_ERROR, vec![], "text/plain").await;
    let healthy = spawn_blob_server(StatusCode::OK, body.clone(), "text/plain").await;
    let app = test_app(vec![], vec![]).await;

    let servers = vec![broken.url.clone(), healthy.url.clone()];
    let blob = app
        .fetch_blob(&hash, &servers, "/file.txt")
        .await
        .expect("second server has the blob");

    assert_eq!(&blob.bytes[..], &body[..]);
    assert_eq!(broken.hits.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mislabeled_stylesheet_is_served_as_css() {
    let pubkey = Pubkey::from_bytes([5u8; 32]);
    let body = b"body { color: red; }".to_vec();
    let hash = sha256_hex(&body);

    let relay = spawn_relay(vec![mapping_event(&pubkey.to_hex(), "/style.css", &hash, 1)]).await;
    let blob = spawn_blob_server(StatusCode::OK, body, "application/json").await;
    let app = test_app(vec![relay.url.clone()], vec![blob.url.clone()]).await;
    let router = server::build_router(app.clone());
    let host = format!("{}.localhost", pubkey.to_npub());

    let response = get(&router, &host, "/style.css", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "text/css");
}

#[tokio::test]
async fn publish_events_precache_ahead_of_requests() {
    let pubkey = Pubkey::from_bytes([6u8; 32]);
    let hash = sha256_hex(b"fresh");

    let relay = spawn_relay(vec![]).await;
    let app = test_app(vec![relay.url.clone()], vec![]).await;

    let event = mapping_event(&pubkey.to_hex(), "/index.html", &hash, 50);
    invalidation::apply_event(&app, &event).await.unwrap();

    let mapping = app
        .resolve_path(&pubkey, "/index.html")
        .await
        .expect("mapping was precached");
    assert_eq!(mapping.sha256, hash);
    assert_eq!(mapping.created_at, 50);
    // The lookup was answered without a single relay query.
    assert_eq!(relay.reqs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn negative_mark_suppresses_repeat_queries() {
    let pubkey = Pubkey::from_bytes([7u8; 32]);
    let relay = spawn_relay(vec![]).await;
    let app = test_app(vec![relay.url.clone()], vec![]).await;

    assert!(app.resolve_path(&pubkey, "/nope/index.html").await.is_none());
    let after_first = relay.reqs.load(Ordering::SeqCst);
    assert!(after_first > 0);

    assert!(app.resolve_path(&pubkey, "/nope/index.html").await.is_none());
    assert_eq!(relay.reqs.load(Ordering::SeqCst), after_first);
}

#[tokio::test]
async fn mapping_event_without_hash_deletes_the_mapping() {
    let pubkey = Pubkey::from_bytes([8u8; 32]);
    let hex = pubkey.to_hex();
    let hash = sha256_hex(b"old");
    let relay = spawn_relay(vec![]).await;
    let app = test_app(vec![relay.url.clone()], vec![]).await;

    invalidation::apply_event(&app, &mapping_event(&hex, "/index.html", &hash, 10))
        .await
        .unwrap();
    assert!(app.resolve_path(&pubkey, "/index.html").await.is_some());

    // A newer event with a d tag but no x tag unpublishes the path.
    let unpublish = Event {
        tags: vec![vec!["d".to_string(), "/index.html".to_string()]],
        created_at: 11,
        ..mapping_event(&hex, "/index.html", &hash, 11)
    };
    invalidation::apply_event(&app, &unpublish).await.unwrap();

    let key = format!("{hex}/index.html");
    assert!(app.cache.get_sticky(Namespace::Paths, &key).await.is_none());
}

#[tokio::test]
async fn stale_mapping_event_does_not_clobber_newer_state() {
    let pubkey = Pubkey::from_bytes([9u8; 32]);
    let hex = pubkey.to_hex();
    let newer = sha256_hex(b"newer");
    let older = sha256_hex(b"older");
    let relay = spawn_relay(vec![]).await;
    let app = test_app(vec![relay.url.clone()], vec![]).await;

    invalidation::apply_event(&app, &mapping_event(&hex, "/a.html", &newer, 20))
        .await
        .unwrap();
    invalidation::apply_event(&app, &mapping_event(&hex, "/a.html", &older, 10))
        .await
        .unwrap();

    let mapping = app.resolve_path(&pubkey, "/a.html").await.unwrap();
    assert_eq!(mapping.sha256, newer);
}

#[tokio::test]
async fn list_events_replace_cached_lists() {
    let pubkey = Pubkey::from_bytes([10u8; 32]);
    let hex = pubkey.to_hex();
    let relay = spawn_relay(vec![]).await;
    let app = test_app(vec![relay.url.clone()], vec![]).await;

    let event = list_event(
        &hex,
        RELAY_LIST_KIND,
        vec![
            vec!["r", "wss://u1.example/", "read"],
            vec!["r", "wss://u2.example/"],
            vec!["r", "wss://u3.example/", "write"],
        ],
    );
    invalidation::apply_event(&app, &event).await.unwrap();
    assert_eq!(
        app.cache.get_sticky(Namespace::Relays, &hex).await,
        Some(CachedValue::RelayList {
            relays: vec!["wss://u1.example/".to_string(), "wss://u2.example/".to_string()],
        })
    );

    // A server list with no usable entries falls back to the defaults
    // (none configured here, so the list comes back empty).
    let event = list_event(&hex, SERVER_LIST_KIND, vec![vec!["server", "::junk::"]]);
    invalidation::apply_event(&app, &event).await.unwrap();
    assert_eq!(
        app.cache.get_sticky(Namespace::Servers, &hex).await,
        Some(CachedValue::ServerList { servers: vec![] })
    );
}

#[tokio::test]
async fn empty_server_list_is_an_immediate_miss() {
    let app = test_app(vec![], vec![]).await;
    let hash = sha256_hex(b"whatever");
    assert!(app.fetch_blob(&hash, &[], "/a.html").await.is_none());
}

#[tokio::test]
async fn exhausted_servers_mean_absent_and_nothing_is_cached() {
    let app = test_app(vec![], vec![]).await;
    let hash = sha256_hex(b"whatever");

    let first = spawn_blob_server(StatusCode::NOT_FOUND, vec![], "text/plain").await;
    let second = spawn_blob_server(StatusCode::NOT_FOUND, vec![], "text/plain").await;
    let servers = vec![first.url.clone(), second.url.clone()];

    assert!(app.fetch_blob(&hash, &servers, "/a.html").await.is_none());
    assert_eq!(first.hits.load(Ordering::SeqCst), 1);
    assert_eq!(second.hits.load(Ordering::SeqCst), 1);
    assert!(app.cache.get_sticky(Namespace::Content, &hash).await.is_none());
}

#[tokio::test]
async fn hostname_label_round_trips_to_the_same_pubkey() {
    let pubkey = Pubkey::from_bytes([11u8; 32]);
    let app = test_app(vec![], vec![]).await;

    let host = format!("{}.localhost", pubkey.to_npub());
    assert_eq!(app.host_pubkey(&host).await, Some(pubkey));
    // Cached second lookup agrees.
    assert_eq!(app.host_pubkey(&host).await, Some(pubkey));

    assert_eq!(app.host_pubkey("localhost").await, None);
    assert_eq!(app.host_pubkey("not-an-npub.localhost").await, None);
    assert_eq!(app.host_pubkey("other-domain.example").await, None);
}

#[tokio::test]
async fn apex_and_unknown_hosts_are_not_served_as_sites() {
    let app = test_app(vec![], vec![]).await;
    let router = server::build_router(app.clone());

    let response = get(&router, "localhost", "/", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "content-type").starts_with("text/html"));

    let response = get(&router, "nobody.localhost", "/", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
