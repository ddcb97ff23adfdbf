//! The HTTP front door: host label to pubkey, then the resolve/fetch
//! pipeline, then strong caching headers on the way out.

use crate::{resolve::normalize_path, App};
use axum::body::{boxed, Empty, Full};
use axum::extract::{Host, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    use axum::routing::get;

    axum::Router::new()
        .route("/", get(serve_site))
        .route("/*path", get(serve_site))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

#[tracing::instrument(level = "debug", skip_all, fields(host = %host, path = %uri.path()))]
async fn serve_site(
    State(app): State<Arc<App>>,
    Host(host): Host,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let host = host
        .split(':')
        .next()
        .unwrap_or(host.as_str())
        .to_ascii_lowercase();
    let Some(pubkey) = app.host_pubkey(&host).await else {
        return landing(&app, &host);
    };

    let path = normalize_path(uri.path());
    let Some(mapping) = app.resolve_path(&pubkey, &path).await else {
        return not_found();
    };

    let etag = format!("\"{}\"", mapping.sha256);
    let revalidated = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |candidate| candidate == etag);
    if revalidated {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag.as_str())
            .header(header::CACHE_CONTROL, app.config.cache_control.as_str())
            .header("x-content-sha256", mapping.sha256.as_str())
            .body(boxed(Empty::new()))
            .expect("static response parts are valid");
    }

    let servers = app.server_list(&pubkey).await;
    let Some(blob) = app.fetch_blob(&mapping.sha256, &servers, &path).await else {
        return not_found();
    };

    metrics::counter!("sites_served").increment(1);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, blob.content_type.as_str())
        .header(header::CONTENT_LENGTH, blob.bytes.len())
        .header(header::ETAG, etag.as_str())
        .header(header::CACHE_CONTROL, app.config.cache_control.as_str())
        .header("x-content-sha256", mapping.sha256.as_str())
        .body(boxed(Full::from(blob.bytes)))
        .expect("static response parts are valid")
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found\n").into_response()
}

// Requests outside any publisher subdomain: a small status page on the
// apex, 404 anywhere else.
fn landing(app: &App, host: &str) -> Response {
    if host == app.config.base_domain {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            LANDING_HTML,
        )
            .into_response()
    } else {
        (StatusCode::NOT_FOUND, "unrecognized site\n").into_response()
    }
}

const LANDING_HTML: &str = "<!doctype html>\n<html>\n<head><title>nsite-gateway</title></head>\n<body>\n<h1>nsite-gateway</h1>\n<p>This gateway serves static sites published to relays. Browse a site at\n<code>https://&lt;npub&gt;.&lt;this domain&gt;/</code>.</p>\n</body>\n</html>\n";
