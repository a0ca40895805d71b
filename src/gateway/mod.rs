//! HTTP surface and server wiring

pub mod auth;
pub mod router;
mod server;

pub use auth::{AuthState, auth_middleware};
pub use router::{AppState, create_router};
pub use server::Gateway;
