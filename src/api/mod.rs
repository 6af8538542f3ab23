//! HTTP surface: health probes, event ingest and chamber control

pub mod control;
pub mod health;
pub mod ingest;
pub mod routes;

pub use routes::{router, ApiError, AppState};
