use std::{collections::HashMap, sync::Arc};

use choicestore::RequestStore;
use mediaplan::SizeProbe;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::extractor::MediaExtractor;
use crate::transport::ChatTransport;
use crate::types::{ActiveJob, PendingRequest};
use crate::worker_loop::WorkerPool;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: AppConfig,
    pub store: RequestStore<PendingRequest>,
    pub pool: WorkerPool,
    /// Queued and running jobs by job id, for the cancel button.
    pub jobs: RwLock<HashMap<String, ActiveJob>>,
    pub extractor: Arc<dyn MediaExtractor>,
    pub transport: Arc<dyn ChatTransport>,
    pub probe: Arc<dyn SizeProbe>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        extractor: Arc<dyn MediaExtractor>,
        transport: Arc<dyn ChatTransport>,
        probe: Arc<dyn SizeProbe>,
    ) -> Self {
        Self {
            store: RequestStore::new(config.store_config()),
            pool: WorkerPool::new(config.queue_capacity),
            jobs: RwLock::new(HashMap::new()),
            config,
            extractor,
            transport,
            probe,
        }
    }

    pub async fn set_job(&self, id: &str, job: ActiveJob) {
        self.jobs.write().await.insert(id.to_string(), job);
    }

    pub async fn get_job(&self, id: &str) -> Option<ActiveJob> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn drop_job(&self, id: &str) {
        self.jobs.write().await.remove(id);
    }
}
