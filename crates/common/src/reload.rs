//! Reload trigger
//!
//! After a peer is added or removed the running interface has to pick up the
//! new server document, either via `wg syncconf` inside the WireGuard
//! container or by restarting the container. Lifecycle operations never wait
//! for this: they drop a [`ReloadRequest`] into a bounded queue and a
//! background [`ReloadWorker`] executes it, retrying with backoff. Outcomes
//! are only logged.

use crate::config::{KeeperConfig, ReloadConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of one reload or restart attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadOutcome {
    pub success: bool,
    pub message: String,
}

impl ReloadOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Makes the live interface re-read its configuration
#[async_trait]
pub trait ReloadTrigger: Send + Sync {
    /// Apply the server document without restarting
    async fn reload(&self) -> ReloadOutcome;

    /// Restart the process serving the interface
    async fn restart(&self) -> ReloadOutcome;
}

// ============================================================================
// Container runtime
// ============================================================================

/// Container runtime detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Detect available container runtime
    pub fn detect() -> Option<Self> {
        if Command::new("docker").arg("--version").output().is_ok() {
            return Some(Self::Docker);
        }
        if Command::new("podman").arg("--version").output().is_ok() {
            return Some(Self::Podman);
        }
        None
    }

    /// Get the CLI command name
    pub fn command(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// Reloads a WireGuard interface running in a container
pub struct ContainerReloader {
    runtime: Option<ContainerRuntime>,
    container: String,
    interface: String,
    conf_path: String,
    timeout: Duration,
}

impl ContainerReloader {
    pub fn new(config: &KeeperConfig) -> Self {
        Self::with_runtime(ContainerRuntime::detect(), config)
    }

    pub fn with_runtime(runtime: Option<ContainerRuntime>, config: &KeeperConfig) -> Self {
        Self {
            runtime,
            container: config.reload.container.clone(),
            interface: config.interface.clone(),
            conf_path: config.container_conf_path(),
            timeout: Duration::from_secs(config.reload.timeout_secs),
        }
    }

    async fn run(&self, args: &[&str], action: &str) -> ReloadOutcome {
        let Some(runtime) = self.runtime else {
            return ReloadOutcome::failed("No container runtime available");
        };
        let cmd = runtime.command();
        debug!("{} {}", cmd, args.join(" "));

        let output = AsyncCommand::new(cmd)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Err(_) => ReloadOutcome::failed(format!(
                "WireGuard {} timed out after {}s",
                action,
                self.timeout.as_secs()
            )),
            Ok(Err(e)) => ReloadOutcome::failed(format!("Failed to run {}: {}", cmd, e)),
            Ok(Ok(out)) if out.status.success() => {
                ReloadOutcome::ok(format!("WireGuard {} succeeded", action))
            }
            Ok(Ok(out)) => ReloadOutcome::failed(format!(
                "Failed to {} WireGuard: {}",
                action,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
        }
    }
}

#[async_trait]
impl ReloadTrigger for ContainerReloader {
    async fn reload(&self) -> ReloadOutcome {
        let args = [
            "exec",
            self.container.as_str(),
            "wg",
            "syncconf",
            self.interface.as_str(),
            self.conf_path.as_str(),
        ];
        self.run(&args, "reload").await
    }

    async fn restart(&self) -> ReloadOutcome {
        self.run(&["restart", self.container.as_str()], "restart").await
    }
}

// ============================================================================
// Background worker
// ============================================================================

/// What a lifecycle change asks the worker to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadRequest {
    Reload,
    Restart,
}

impl From<crate::config::ReloadMode> for ReloadRequest {
    fn from(mode: crate::config::ReloadMode) -> Self {
        match mode {
            crate::config::ReloadMode::Restart => Self::Restart,
            crate::config::ReloadMode::Syncconf => Self::Reload,
        }
    }
}

/// Sending side of the reload queue
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: Option<mpsc::Sender<ReloadRequest>>,
}

impl ReloadHandle {
    /// Handle that drops every request
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a request without waiting
    pub fn notify(&self, request: ReloadRequest) {
        let Some(tx) = &self.tx else {
            debug!("Reload disabled, dropping {:?}", request);
            return;
        };
        match tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Reload queue full, {:?} coalesced with pending work", request);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Reload worker stopped; {:?} not delivered", request);
            }
        }
    }
}

/// Retry policy for one queued request
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&ReloadConfig> for RetryPolicy {
    fn from(config: &ReloadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Background task executing queued reload requests
pub struct ReloadWorker {
    handle: ReloadHandle,
    task: JoinHandle<()>,
}

impl ReloadWorker {
    /// Spawn the worker on the current runtime
    pub fn spawn(trigger: Arc<dyn ReloadTrigger>, policy: RetryPolicy, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let task = tokio::spawn(run_worker(trigger, policy, rx));
        Self {
            handle: ReloadHandle { tx: Some(tx) },
            task,
        }
    }

    pub fn handle(&self) -> ReloadHandle {
        self.handle.clone()
    }

    /// Stop accepting requests and wait for queued ones, at most `grace`.
    /// Other clones of the handle must be dropped first.
    pub async fn shutdown(self, grace: Duration) {
        drop(self.handle);
        match tokio::time::timeout(grace, self.task).await {
            Ok(Ok(())) => debug!("Reload worker finished"),
            Ok(Err(e)) => warn!("Reload worker failed: {}", e),
            Err(_) => warn!("Reload worker still busy after {}s, abandoning", grace.as_secs()),
        }
    }
}

async fn run_worker(
    trigger: Arc<dyn ReloadTrigger>,
    policy: RetryPolicy,
    mut rx: mpsc::Receiver<ReloadRequest>,
) {
    while let Some(first) = rx.recv().await {
        // Everything queued behind this one is covered by a single run;
        // a restart subsumes a reload.
        let mut request = first;
        while let Ok(next) = rx.try_recv() {
            if next == ReloadRequest::Restart {
                request = ReloadRequest::Restart;
            }
        }
        execute(trigger.as_ref(), request, policy).await;
    }
}

async fn execute(trigger: &dyn ReloadTrigger, request: ReloadRequest, policy: RetryPolicy) {
    let mut backoff = policy.backoff;
    for attempt in 1..=policy.max_attempts {
        let outcome = match request {
            ReloadRequest::Reload => trigger.reload().await,
            ReloadRequest::Restart => trigger.restart().await,
        };

        if outcome.success {
            info!("{}", outcome.message);
            return;
        }

        warn!(
            "{:?} attempt {}/{} failed: {}",
            request, attempt, policy.max_attempts, outcome.message
        );
        if attempt < policy.max_attempts {
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }
    warn!("Giving up on {:?}; the interface may need a manual restart", request);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds
    struct FlakyTrigger {
        failures: u32,
        reloads: AtomicU32,
        restarts: AtomicU32,
        delay: Duration,
    }

    impl FlakyTrigger {
        fn new(failures: u32, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                failures,
                reloads: AtomicU32::new(0),
                restarts: AtomicU32::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl ReloadTrigger for FlakyTrigger {
        async fn reload(&self) -> ReloadOutcome {
            let n = self.reloads.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                ReloadOutcome::failed("not yet")
            } else {
                ReloadOutcome::ok("reloaded")
            }
        }

        async fn restart(&self) -> ReloadOutcome {
            tokio::time::sleep(self.delay).await;
            let n = self.restarts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                ReloadOutcome::failed("container unavailable")
            } else {
                ReloadOutcome::ok("restarted")
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let trigger = FlakyTrigger::new(2, Duration::ZERO);
        let worker = ReloadWorker::spawn(trigger.clone(), policy(5), 4);
        worker.handle().notify(ReloadRequest::Reload);
        worker.shutdown(Duration::from_secs(5)).await;

        assert_eq!(trigger.reloads.load(Ordering::SeqCst), 3);
        assert_eq!(trigger.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let trigger = FlakyTrigger::new(100, Duration::ZERO);
        let worker = ReloadWorker::spawn(trigger.clone(), policy(3), 4);
        worker.handle().notify(ReloadRequest::Restart);
        worker.shutdown(Duration::from_secs(5)).await;

        assert_eq!(trigger.restarts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_notify_does_not_wait_for_trigger() {
        let trigger = FlakyTrigger::new(0, Duration::from_millis(200));
        let worker = ReloadWorker::spawn(trigger.clone(), policy(1), 4);

        let started = std::time::Instant::now();
        worker.handle().notify(ReloadRequest::Restart);
        assert!(started.elapsed() < Duration::from_millis(100));

        worker.shutdown(Duration::from_secs(5)).await;
        assert_eq!(trigger.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_burst_is_coalesced() {
        let trigger = FlakyTrigger::new(0, Duration::from_millis(50));
        let worker = ReloadWorker::spawn(trigger.clone(), policy(1), 2);
        let handle = worker.handle();
        for _ in 0..10 {
            handle.notify(ReloadRequest::Restart);
        }
        drop(handle);
        worker.shutdown(Duration::from_secs(5)).await;

        let restarts = trigger.restarts.load(Ordering::SeqCst);
        assert!(restarts >= 1 && restarts <= 3, "restarts = {}", restarts);
    }

    #[test]
    fn test_disabled_handle_is_noop() {
        ReloadHandle::disabled().notify(ReloadRequest::Reload);
    }

    #[tokio::test]
    async fn test_missing_runtime_is_reported_not_fatal() {
        let reloader = ContainerReloader::with_runtime(None, &KeeperConfig::default());
        let outcome = reloader.restart().await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("No container runtime"));
        assert!(!reloader.reload().await.success);
    }
}
