//! HTTP surface for the marketplace core.

mod routes;

pub use routes::{create_router, AppState};
