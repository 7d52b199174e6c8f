pub mod collab;
pub mod config;
pub mod core;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod session;
pub mod state;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use errors::{SessionError, SessionResult};
pub use session::{CallContext, CallSession, SessionParams};
pub use state::AppState;
