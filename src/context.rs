use std::sync::Arc;

use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::{EventBus, ProgressTracker};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub progress: ProgressTracker,
    pub events: EventBus,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Self {
        Self {
            config: Arc::new(config),
            db,
            progress: ProgressTracker::new(),
            events: EventBus::default(),
        }
    }
}
