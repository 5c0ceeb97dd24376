// bagstream - bag ingestion and slice decompression core for X-ray screening workstations
//
// This is the library crate containing the bag pool, the dispatch pipeline and
// their configuration. The binary crate (main.rs) runs a synthetic feed through it.

pub mod config;
pub mod context;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod services;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use context::IngestContext;
pub use events::{BagEvent, EventBus};
pub use metrics::Metrics;
pub use models::{BagHandle, BagRecord, BagState, BagStateMask, WorkstationConfig};
pub use pool::BagPool;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
