//! Shared application state.

use std::sync::Arc;

use chatrelay_chat::{AdapterSet, ProviderSettings};
use chatrelay_core::RelayConfig;
use chatrelay_runtime::{Orchestrator, RuntimeOptions};
use chatrelay_store::SqliteStore;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub config: RelayConfig,
    pub store: Arc<SqliteStore>,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        store: Arc<SqliteStore>,
        settings: &ProviderSettings,
        adapters: AdapterSet,
    ) -> Self {
        let options = RuntimeOptions {
            system_user_id: config.system_user_id,
            dify_default_user: settings.dify_default_user.clone(),
        };
        let orchestrator = Orchestrator::new(store.clone(), adapters, options);

        Self {
            config,
            store,
            orchestrator,
        }
    }
}
