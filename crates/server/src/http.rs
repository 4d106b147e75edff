//! HTTP ingress for artifact downloads.
//!
//! One route: `GET /{token}`. The token is the only credential; a stale or
//! unknown one is a plain 404 with no hint about which scripts exist.
//! Responses forbid caching so a proxy cannot keep serving a dead generation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::endpoints::EndpointRegistry;
use crate::error::ServerError;

#[derive(Clone)]
pub struct HttpState {
    pub endpoints: Arc<EndpointRegistry>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/:token", get(serve_artifact))
        .with_state(state)
}

pub struct HttpServer {
    listener: TcpListener,
    state: HttpState,
}

impl HttpServer {
    pub async fn bind(addr: &str, state: HttpState) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = %self.listener.local_addr()?, "http ingress listening");
        axum::serve(self.listener, router(self.state)).await?;
        Ok(())
    }
}

async fn serve_artifact(
    State(state): State<HttpState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    let Some(script_id) = state.endpoints.resolve(&token) else {
        debug!(%token, "download with unknown token");
        return StatusCode::NOT_FOUND.into_response();
    };

    match state.endpoints.encrypted_bytes(script_id) {
        Ok(bytes) => {
            debug!(script_id, len = bytes.len(), "serving artifact");
            (StatusCode::OK, no_cache_headers(), bytes).into_response()
        }
        Err(e) => {
            error!(script_id, error = %e, "artifact unavailable");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn no_cache_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testutil::seed_config;
    use crate::store::ScriptStore;
    use axum::body::Body;
    use axum::http::Request;
    use scriptcast_protocol::ArtifactCipher;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    fn test_state() -> (TempDir, HttpState) {
        let dir = TempDir::new().unwrap();
        seed_config(dir.path());
        let store = Arc::new(ScriptStore::open(dir.path()).unwrap());
        let endpoints = Arc::new(EndpointRegistry::new(
            store,
            ArtifactCipher::new([3; 32], [4; 16]),
        ));
        (dir, HttpState { endpoints })
    }

    async fn get_path(state: HttpState, path: &str) -> axum::response::Response {
        router(state)
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn known_token_serves_encrypted_artifact() {
        let (_dir, state) = test_state();
        let token = state.endpoints.token_for(0).unwrap();
        let expected = state.endpoints.encrypted_bytes(0).unwrap();

        let response = get_path(state, &format!("/{token}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(response.headers().get(header::PRAGMA).unwrap(), "no-cache");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn unknown_token_is_404() {
        let (_dir, state) = test_state();
        let response = get_path(state, "/definitely-not-a-token").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unreadable_artifact_is_500() {
        let (dir, state) = test_state();
        let token = state.endpoints.token_for(0).unwrap();
        std::fs::remove_file(dir.path().join("artifacts/fisher.jar")).unwrap();

        let response = get_path(state, &format!("/{token}")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
