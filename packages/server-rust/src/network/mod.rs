//! Networking: host configuration, lifecycle control, HTTP layers and the
//! axum handlers that front the request governor.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod shutdown;

pub use config::*;
pub use handlers::{build_router, AppState};
pub use shutdown::*;
