//! Operational HTTP endpoint
//!
//! Serves `/health` and the Prometheus `/metrics` text exposition.

mod handlers;
mod server;

pub use handlers::{ApiState, HealthResponse};
pub use server::{router, run_server};
