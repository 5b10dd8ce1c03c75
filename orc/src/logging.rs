//! Developer-facing tracing setup.
//!
//! This is separate from the product-facing `history.log` / activity-log framing
//! written by [`crate::io::run_state`] and [`crate::io::agent_client`], which are
//! durable artifacts consumed by the dashboard, not a tracing sink.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
