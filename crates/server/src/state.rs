//! Application state

use std::sync::Arc;

use tokio::sync::Mutex;
use unembed_engine::{BlobSink, Clock, DocumentStore, RuleSet, SystemClock};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub sink: Arc<dyn BlobSink>,
    pub rules: Arc<RuleSet>,
    pub clock: Arc<dyn Clock>,

    /// Held for the duration of a migration run; at most one in flight.
    pub migration_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, sink: Arc<dyn BlobSink>, rules: RuleSet) -> Self {
        Self {
            store,
            sink,
            rules: Arc::new(rules),
            clock: Arc::new(SystemClock),
            migration_lock: Arc::new(Mutex::new(())),
        }
    }
}
