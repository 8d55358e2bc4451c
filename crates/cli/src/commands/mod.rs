//! CLI Commands

pub mod peer;
pub mod server;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use wgkeeper_common::{
    ContainerReloader, FsStore, KeeperConfig, PeerManager, PrometheusTelemetry, ReloadTrigger,
    ReloadWorker, RetryPolicy,
};

/// Manager plus the background reload worker for one CLI invocation
pub struct App {
    pub manager: PeerManager,
    worker: ReloadWorker,
    grace: Duration,
}

impl App {
    pub fn new(config: &KeeperConfig) -> Result<Self> {
        let store = Arc::new(FsStore::new(&config.wireguard_path));
        let trigger: Arc<dyn ReloadTrigger> = Arc::new(ContainerReloader::new(config));
        let worker = ReloadWorker::spawn(
            trigger.clone(),
            RetryPolicy::from(&config.reload),
            config.reload.queue_depth,
        );

        let mut manager = PeerManager::new(config, store)?
            .with_reload(worker.handle())
            .with_trigger(trigger);
        if let Some(telemetry) = PrometheusTelemetry::from_config(&config.telemetry)? {
            manager = manager.with_telemetry(Arc::new(telemetry));
        }

        // Every attempt may take the full timeout plus the doubling backoff
        let reload = &config.reload;
        let attempts = u64::from(reload.max_attempts.max(1));
        let grace = Duration::from_secs(reload.timeout_secs * attempts)
            + Duration::from_millis(reload.backoff_ms.saturating_mul((1u64 << attempts.min(16)) - 1));

        Ok(Self {
            manager,
            worker,
            grace,
        })
    }

    /// Wait for queued reloads before the process exits
    pub async fn finish(self) {
        drop(self.manager);
        self.worker.shutdown(self.grace).await;
    }
}
