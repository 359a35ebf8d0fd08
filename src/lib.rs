pub mod api;
pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod instrument;
pub mod metrics;
pub mod notify;
pub mod outcome;
pub mod recorder;
pub mod server;
pub mod store;
pub mod trace;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` wins when set; otherwise `default_level` is used. The serve
/// command passes the configured `server.log_level` here.
///
/// Note: This function can only be called once.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
