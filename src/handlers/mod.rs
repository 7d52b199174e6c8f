//! HTTP and WebSocket request handlers.
//!
//! - `api` - Health check endpoint
//! - `call` - Telephony media-stream WebSocket

pub mod api;
pub mod call;

pub use call::call_handler;
