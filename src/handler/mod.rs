//! Front door: one HTTP listener carrying the carrier webhook path, the
//! media-stream upgrade path, and the internal self-test used by the
//! preflight.

use crate::call::preflight::SELF_TEST_HEADER;
use crate::call::CallManager;
use crate::provider::{CallProvider, WebhookRequest};
use crate::stream::StreamBridge;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct FrontDoor {
    pub manager: Arc<CallManager>,
    pub bridge: Arc<StreamBridge>,
    pub provider: Arc<dyn CallProvider>,
    pub boot_secret: String,
}

pub fn router(state: FrontDoor, webhook_path: &str, stream_path: &str) -> Router {
    Router::new()
        .route(webhook_path, post(webhook_handler))
        .route(stream_path, any(stream_handler))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn webhook_handler(
    State(state): State<FrontDoor>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    // The preflight proves reachability with the boot secret; it never
    // carries a carrier signature.
    if let Some(token) = headers.get(SELF_TEST_HEADER).and_then(|v| v.to_str().ok()) {
        if token == state.boot_secret {
            return (StatusCode::OK, "OK").into_response();
        }
        // Wrong token: fall through and let the signature check decide.
    }

    let request = WebhookRequest {
        path_and_query: uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| uri.path())
            .to_string(),
        headers,
        body,
    };

    let outcome = state.provider.verify_webhook(&request);
    if !outcome.ok {
        if outcome.ngrok_free_tier {
            warn!(
                url = outcome.url.as_deref().unwrap_or(""),
                "webhook signature mismatch behind ngrok free tier; \
                 free-tier URL rewriting breaks carrier signing"
            );
        } else {
            warn!(
                url = outcome.url.as_deref().unwrap_or(""),
                reason = outcome.reason.as_deref().unwrap_or(""),
                "webhook signature rejected"
            );
        }
        return (StatusCode::UNAUTHORIZED, "signature verification failed").into_response();
    }

    let (events, reply) = state.provider.parse_webhook_event(&request);
    for event in events {
        state.manager.process_event(event).await;
    }

    Response::builder()
        .status(reply.status)
        .header(header::CONTENT_TYPE, reply.content_type)
        .body(reply.body.into())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn stream_handler(State(state): State<FrontDoor>, ws: WebSocketUpgrade) -> Response {
    info!("media stream upgrade");
    let bridge = state.bridge.clone();
    ws.on_upgrade(move |socket| bridge.handle_socket(socket))
}
