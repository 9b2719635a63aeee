use std::sync::Arc;
use terrapipe_core::{Config, Orchestrator};

use crate::api::WsBroadcaster;

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Arc<Orchestrator>,
    ws_broadcaster: WsBroadcaster,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>, ws_broadcaster: WsBroadcaster) -> Self {
        Self {
            config,
            orchestrator,
            ws_broadcaster,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn ws_broadcaster(&self) -> &WsBroadcaster {
        &self.ws_broadcaster
    }
}
