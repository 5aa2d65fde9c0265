//! Generic reconciliation runner.
//!
//! A [`Controller`] drives one [`Reconciler`] (one resource kind):
//!
//! 1. Store watch events for the kind, and for objects the kind owns, are
//!    turned into queue keys.
//! 2. Workers take keys off the [`WorkQueue`]; a key is never processed by
//!    two workers at once.
//! 3. Every pass runs under a timeout and is abandoned on shutdown. An
//!    abandoned pass has written nothing, so the next one resumes from the
//!    persisted status.
//! 4. The returned [`Action`] (or error) decides when the key runs again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use warden_common::{Backoff, Classify, ErrorClass, ObjectKey, PassId};

use crate::queue::WorkQueue;
use crate::store::{ResourceStore, StoreError, WatchEvent};

// ============================================================================
// Pass results
// ============================================================================

/// When a key should be reconciled next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Only when something changes
    AwaitChange,
    /// After a fixed delay
    Requeue(Duration),
    /// After the key's exponential backoff delay
    Backoff,
}

impl Action {
    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue(delay: Duration) -> Self {
        Action::Requeue(delay)
    }

    /// Requeue at an absolute time; times in the past mean "now".
    pub fn requeue_at(at: DateTime<Utc>) -> Self {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Action::Requeue(delay)
    }

    pub fn backoff() -> Self {
        Action::Backoff
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Retry no earlier than `after` (rate limits, Retry-After)
    #[error("{message}")]
    RetryAfter { message: String, after: Duration },

    #[error("{0}")]
    Transient(String),
}

impl ReconcileError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::RetryAfter { after, .. } => Some(*after),
            _ => None,
        }
    }
}

impl Classify for ReconcileError {
    fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(e) => e.class(),
            _ => ErrorClass::Transient,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Store(e) => e.reason(),
            ReconcileError::RetryAfter { .. } => "RateLimited",
            ReconcileError::Transient(_) => "Transient",
        }
    }
}

/// One resource kind's reconciliation logic.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Kind of object this reconciler owns.
    fn kind(&self) -> &'static str;

    /// Run one pass for `key`. The object may no longer exist.
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub workers: usize,
    pub pass_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            pass_timeout: Duration::from_secs(120),
            backoff: Backoff::default(),
        }
    }
}

pub struct Controller<R> {
    reconciler: Arc<R>,
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
    options: ControllerOptions,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, store: Arc<dyn ResourceStore>, options: ControllerOptions) -> Self {
        let queue = Arc::new(WorkQueue::new(options.backoff));
        Self {
            reconciler,
            store,
            queue,
            options,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let kind = self.reconciler.kind();
        info!(kind, workers = self.options.workers, "Starting controller");

        // Subscribe before the initial list so no change falls in between
        let watch = self.store.watch();
        resync(kind, self.store.as_ref(), &self.queue).await;

        let pump = tokio::spawn(pump_events(
            kind,
            watch,
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            shutdown.clone(),
        ));

        let mut workers = Vec::with_capacity(self.options.workers);
        for worker in 0..self.options.workers.max(1) {
            let reconciler = Arc::clone(&self.reconciler);
            let queue = Arc::clone(&self.queue);
            let shutdown = shutdown.clone();
            let pass_timeout = self.options.pass_timeout;
            workers.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process(reconciler.as_ref(), &queue, key, pass_timeout, &shutdown).await;
                }
                trace!(kind, worker, "Worker stopped");
            }));
        }

        shutdown.cancelled().await;
        info!(kind, "Stopping controller");
        self.queue.shutdown();

        let _ = pump.await;
        for worker in workers {
            let _ = worker.await;
        }
        info!(kind, "Controller stopped");
    }
}

/// Enqueue every object of `kind`.
async fn resync(kind: &str, store: &dyn ResourceStore, queue: &WorkQueue<ObjectKey>) {
    match store.list(kind, None).await {
        Ok(objects) => {
            for object in &objects {
                if let Ok(meta) = crate::store::object_meta(object) {
                    queue.add(ObjectKey::new(kind, meta.namespace, meta.name));
                }
            }
            debug!(kind, count = objects.len(), "Resynced");
        }
        Err(e) => warn!(kind, error = %e, "Resync failed"),
    }
}

/// Keys a watch event should wake for `kind`: the object itself, or its owner.
pub(crate) fn route(kind: &str, event: &WatchEvent) -> Vec<ObjectKey> {
    let mut keys = Vec::new();
    if event.key.kind == kind {
        keys.push(event.key.clone());
    }
    if let Some(owner) = &event.owner {
        if owner.kind == kind {
            keys.push(owner.clone());
        }
    }
    keys
}

async fn pump_events(
    kind: &'static str,
    mut watch: tokio::sync::broadcast::Receiver<WatchEvent>,
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = watch.recv() => match event {
                Ok(event) => {
                    for key in route(kind, &event) {
                        queue.add(key);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(kind, missed, "Watch lagged, resyncing");
                    resync(kind, store.as_ref(), &queue).await;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Run one pass for `key` and schedule the next.
pub(crate) async fn process<R: Reconciler + ?Sized>(
    reconciler: &R,
    queue: &Arc<WorkQueue<ObjectKey>>,
    key: ObjectKey,
    pass_timeout: Duration,
    shutdown: &CancellationToken,
) {
    let pass = PassId::new();
    let span = info_span!("reconcile", kind = reconciler.kind(), key = %key, pass = %pass);

    async {
        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            result = tokio::time::timeout(pass_timeout, reconciler.reconcile(&key)) => Some(result),
        };

        match outcome {
            None => debug!("Pass abandoned on shutdown"),
            Some(Err(_)) => {
                let delay = queue.add_rate_limited(key.clone());
                warn!(
                    timeout_secs = pass_timeout.as_secs(),
                    retry_ms = delay.as_millis() as u64,
                    "Pass timed out"
                );
            }
            Some(Ok(Ok(action))) => {
                trace!(action = ?action, "Pass complete");
                match action {
                    Action::AwaitChange => queue.forget(&key),
                    Action::Requeue(delay) => {
                        queue.forget(&key);
                        queue.add_after(key.clone(), delay);
                    }
                    Action::Backoff => {
                        queue.add_rate_limited(key.clone());
                    }
                }
            }
            Some(Ok(Err(e))) => match e.retry_after() {
                Some(delay) => {
                    info!(error = %e, retry_secs = delay.as_secs(), "Pass deferred");
                    queue.add_after(key.clone(), delay);
                }
                None => {
                    let delay = queue.add_rate_limited(key.clone());
                    if matches!(e, ReconcileError::Store(ref s) if s.is_conflict()) {
                        debug!(error = %e, "Pass hit a write conflict");
                    } else {
                        warn!(error = %e, retry_ms = delay.as_millis() as u64, "Pass failed");
                    }
                }
            },
        }

        queue.done(&key);
    }
    .instrument(span)
    .await
}
