use std::sync::Arc;

use crate::power::PowerSource;
use crate::runner::Runner;
use crate::storage::RunStore;
use crate::telemetry::BroadcastSink;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
    pub store: RunStore,
    pub power: Arc<dyn PowerSource>,
    pub stream: Arc<BroadcastSink>,
}
