pub mod backfill;
pub mod catalog;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod formula;
pub mod http_client;
pub mod model;
pub mod plan;
pub mod registry;
pub mod retry;
pub mod season;
pub mod sheet_export;
pub mod stats_api;
pub mod store;
pub mod tracker;
pub mod transforms;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber; `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,glass_etl=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
