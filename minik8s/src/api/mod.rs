//! The declarative HTTP API surface: validation, defaulting, delegation to
//! the store, and chunked watch streams.

pub mod server;
pub mod validation;

pub use server::{build_router, serve, AppState};
