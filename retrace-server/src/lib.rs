//! HTTP/SSE host for the retrace history service.

pub mod auth;
pub mod diff;
pub mod handlers;
pub mod routes;
pub mod sse;
pub mod state;

pub use routes::router;
pub use sse::EventBroadcaster;
pub use state::AppState;
