//! HTTP and WebSocket route configuration.
//!
//! # Endpoints
//!
//! `GET /` - Health check
//! `GET /call` - WebSocket upgrade for a telephony media stream
//!
//! The media-stream protocol after upgrade: the bridge sends `connected`
//! and `start` control frames, then base64 companded audio in `media`
//! frames. The server answers with `media`, `mark`, and `clear` frames
//! on the same socket.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{api, call_handler};
use crate::state::AppState;

pub fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(api::health_check))
        .route("/call", get(call_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
