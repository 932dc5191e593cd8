//! Reverse proxy resolver: serves published artifacts by subdomain

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::deploy::publisher::artifact_key;
use crate::server::state::ProxyState;

/// Split a request into the subdomain and the object path to serve.
///
/// `demo.localhost:9000` + `/` gives `("demo", "index.html")`.
pub fn resolve(host: &str, path: &str) -> Option<(String, String)> {
    let hostname = host.split(':').next().unwrap_or(host);
    let (subdomain, rest) = hostname.split_once('.')?;
    if subdomain.is_empty() || rest.is_empty() {
        return None;
    }

    let mut relative = path.trim_start_matches('/').to_string();
    if relative.is_empty() || relative.ends_with('/') {
        relative.push_str("index.html");
    }
    Some((subdomain.to_ascii_lowercase(), relative))
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

/// Proxy handler
pub async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or_default();

    let Some((subdomain, relative)) = resolve(host, uri.path()) else {
        return not_found();
    };

    let project = match state.store.find_project_by_subdomain(&subdomain).await {
        Ok(Some(project)) => project,
        Ok(None) => return not_found(),
        Err(e) => {
            warn!("Unable to resolve subdomain {}: {}", subdomain, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let key = artifact_key(&state.directory_prefix, &project.id, &relative);
    match state.blob.get(&state.bucket, &key).await {
        Ok(Some(object)) => (
            [(header::CONTENT_TYPE, object.content_type)],
            object.bytes,
        )
            .into_response(),
        Ok(None) => not_found(),
        // Storage failures read as missing
        Err(e) => {
            debug!("Fetching {} failed: {}", key, e);
            not_found()
        }
    }
}
