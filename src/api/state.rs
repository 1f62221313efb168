use std::sync::Arc;

use crate::config::Config;
use crate::db::{DocumentStore, MemoryStore};
use crate::models::Collections;
use crate::services::{PreselectionEngine, RelationManager};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub relations: RelationManager,
    pub preselection: PreselectionEngine,
    /// Collections used when a request names none
    pub defaults: Collections,
}

impl AppState {
    /// Wires the services around an already-built store
    pub fn new(store: Arc<dyn DocumentStore>, config: &Config) -> Self {
        Self {
            relations: RelationManager::new(store.clone(), config),
            preselection: PreselectionEngine::new(store.clone()),
            defaults: Collections::new(
                config.user_collection.clone(),
                config.movie_collection.clone(),
            ),
            store,
        }
    }

    /// State over a fresh in-memory store with default configuration
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), &Config::default())
    }
}
