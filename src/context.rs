// Ingestion context
//
// Explicitly constructed bundle of the shared components. It is created once at
// startup and cloned into the dispatcher, producers and the render consumer in
// place of process-wide singletons.

use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::models::{ConfigError, WorkstationConfig};
use crate::pool::BagPool;
use crate::services::codec::SliceCodec;
use std::sync::Arc;

/// Shared components of the ingestion core
///
/// Cloning is cheap: every field is reference counted.
#[derive(Clone)]
pub struct IngestContext {
    pub config: Arc<WorkstationConfig>,
    pub pool: Arc<BagPool>,
    pub codec: Arc<dyn SliceCodec>,
    pub metrics: Arc<Metrics>,
    pub events: EventBus,
}

impl IngestContext {
    /// Validate `config` and allocate the bag pool for the configured role.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the settings cannot run a pool
    pub fn new(config: WorkstationConfig, codec: Arc<dyn SliceCodec>) -> Result<Self, ConfigError> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let pool = Arc::new(BagPool::new(
            config.pool_size(),
            config.slice_bytes(),
            events.clone(),
        ));

        tracing::info!(
            "Ingest context ready: role={}, slots={}, workers={}, slice={}x{}, codec={}",
            config.role,
            pool.slot_count(),
            config.worker_count,
            config.slice_width,
            config.slice_height,
            codec.name()
        );

        Ok(Self {
            config: Arc::new(config),
            pool,
            codec,
            metrics: Arc::new(Metrics::new()),
            events,
        })
    }

    /// Release every pool slot. Call after the dispatcher has shut down.
    pub fn destroy(&self) {
        self.pool.destroy();
        self.metrics.log_summary();
    }
}

impl std::fmt::Debug for IngestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestContext")
            .field("config", &self.config)
            .field("slots", &self.pool.slot_count())
            .field("codec", &self.codec.name())
            .finish()
    }
}
