use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex as CycleLock, oneshot, watch},
    time::{Duration, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    persist::{PersistError, ReplicaSink},
    types::Revision,
};

use super::{
    replica::{Replica, ReplicaError},
    transport::{PullTransport, TransportError},
};

/// Connection state of a [`SyncClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No scheduled pulls; the replica is kept as-is.
    Disconnected,
    /// First pull after `connect` is running.
    Connecting,
    /// Idle between pulls.
    Connected,
    /// A pull cycle is in flight.
    Syncing,
    /// The last cycle failed.
    Error {
        /// True while the scheduler keeps retrying on its interval.
        will_retry: bool,
    },
}

/// Tuning for [`SyncClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Period of scheduled pulls.
    pub sync_interval_ms: u64,
    /// Upper bound for one pull request.
    pub pull_timeout_ms: u64,
    /// Discard the replica after a consistency error so the next cycle starts over.
    pub wipe_on_consistency_error: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 30_000,
            pull_timeout_ms: 10_000,
            wipe_on_consistency_error: true,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON config; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets [`ClientConfig::sync_interval_ms`].
    pub fn with_sync_interval_ms(mut self, ms: u64) -> Self {
        self.sync_interval_ms = ms;
        self
    }

    /// Sets [`ClientConfig::pull_timeout_ms`].
    pub fn with_pull_timeout_ms(mut self, ms: u64) -> Self {
        self.pull_timeout_ms = ms;
        self
    }

    /// Sets [`ClientConfig::wipe_on_consistency_error`].
    pub fn with_wipe_on_consistency_error(mut self, wipe: bool) -> Self {
        self.wipe_on_consistency_error = wipe;
        self
    }
}

/// Failure of a sync cycle or client call.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The server could not be reached.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// The replica disagrees with the server and must be rebuilt.
    #[error("replica diverged from server: {0}")]
    Consistency(#[from] ReplicaError),
    /// The replica sink failed; the batch was rolled back.
    #[error("replica persistence: {0}")]
    Persist(#[from] PersistError),
    /// `sync_now` was called while disconnected.
    #[error("client is not connected")]
    NotConnected,
}

impl SyncError {
    /// Transient errors are retried on the next interval without data loss.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Persist(_))
    }
}

/// Result of one pull cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Changes were applied and the watermark advanced.
    Applied {
        /// Number of records applied.
        changes: usize,
        /// Watermark after the cycle.
        watermark: Revision,
    },
    /// Another cycle was already in flight.
    Skipped,
}

/// Keeps a [`Replica`] in step with the server through periodic pulls.
pub struct SyncClient<T: PullTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: PullTransport> Clone for SyncClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    transport: T,
    config: ClientConfig,
    replica: Mutex<Replica>,
    sink: Mutex<Option<Box<dyn ReplicaSink>>>,
    state_tx: watch::Sender<SyncState>,
    cycle: CycleLock<()>,
    connected: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl<T: PullTransport> SyncClient<T> {
    /// Client with an empty, unpersisted replica.
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self::with_replica(transport, config, Replica::new(), None)
    }

    /// Resumes from a previously persisted replica, writing every applied batch to `sink`.
    pub fn with_replica(
        transport: T,
        config: ClientConfig,
        replica: Replica,
        sink: Option<Box<dyn ReplicaSink>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                replica: Mutex::new(replica),
                sink: Mutex::new(sink),
                state_tx,
                cycle: CycleLock::new(()),
                connected: AtomicBool::new(false),
                stop_tx: Mutex::new(None),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> SyncState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state_tx.subscribe()
    }

    /// Watermark of the replica.
    pub fn watermark(&self) -> Option<Revision> {
        self.inner.replica.lock().watermark()
    }

    /// Runs `f` against the current replica contents.
    pub fn read<R>(&self, f: impl FnOnce(&Replica) -> R) -> R {
        f(&self.inner.replica.lock())
    }

    /// Gives `f` write access to the replica, e.g. for UI edits while offline.
    pub fn write_local<R>(&self, f: impl FnOnce(&mut Replica) -> R) -> R {
        f(&mut self.inner.replica.lock())
    }

    /// Pulls once, then keeps pulling every `sync_interval_ms`.
    ///
    /// Refuses to start while the replica holds local-only changes.
    pub async fn connect(&self) -> Result<CycleOutcome, SyncError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return self.sync_now().await;
        }

        let dirty = self.inner.replica.lock().local_change_count();
        if dirty > 0 {
            self.inner.set_state(SyncState::Error { will_retry: false });
            error!(local_changes = dirty, "refusing to connect with local-only changes");
            return Err(ReplicaError::LocalChanges(dirty).into());
        }

        self.inner.set_state(SyncState::Connecting);
        self.inner.connected.store(true, Ordering::SeqCst);
        let first = self.inner.run_cycle(true).await;
        self.start_scheduler();
        first
    }

    /// Triggers a pull now. Returns [`CycleOutcome::Skipped`] when one is already running.
    pub async fn sync_now(&self) -> Result<CycleOutcome, SyncError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        self.inner.run_cycle(false).await
    }

    /// Stops scheduled pulls. A pull already in flight still completes and applies.
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(stop) = self.inner.stop_tx.lock().take() {
            let _ = stop.send(());
        }
        self.inner.set_state(SyncState::Disconnected);
        info!("sync client disconnected");
    }

    /// Wipes the replica and watermark, then connects from scratch.
    pub async fn reset(&self) -> Result<CycleOutcome, SyncError> {
        self.disconnect();
        {
            let _guard = self.inner.cycle.lock().await;
            self.inner.wipe()?;
        }
        self.connect().await
    }

    fn start_scheduler(&self) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        *self.inner.stop_tx.lock() = Some(stop_tx);

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let period = Duration::from_millis(self.inner.config.sync_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break; };
                if !inner.connected.load(Ordering::SeqCst) {
                    break;
                }
                let _ = inner.run_cycle(false).await;
            }
            debug!("sync scheduler stopped");
        });
    }
}

impl<T: PullTransport> Inner<T> {
    fn set_state(&self, state: SyncState) {
        self.state_tx.send_replace(state);
    }

    /// One pull cycle. The initial cycle of `connect` waits for the cycle
    /// lock and stays in `Connecting`; every other cycle skips when busy.
    async fn run_cycle(&self, initial: bool) -> Result<CycleOutcome, SyncError> {
        let _guard = if initial {
            self.cycle.lock().await
        } else {
            match self.cycle.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("pull already in flight, skipping");
                    return Ok(CycleOutcome::Skipped);
                }
            }
        };

        if !initial && self.connected.load(Ordering::SeqCst) {
            self.set_state(SyncState::Syncing);
        }
        let result = self.pull_and_apply().await;
        let connected = self.connected.load(Ordering::SeqCst);

        match &result {
            Ok(outcome) => {
                info!(?outcome, "pull cycle applied");
                self.set_state(if connected {
                    SyncState::Connected
                } else {
                    SyncState::Disconnected
                });
            }
            Err(err) => {
                if matches!(err, SyncError::Consistency(_)) {
                    error!(error = %err, "replica diverged from server");
                    if self.config.wipe_on_consistency_error {
                        if let Err(wipe_err) = self.wipe() {
                            error!(error = %wipe_err, "failed to wipe replica");
                        }
                    }
                } else {
                    warn!(error = %err, "pull cycle failed");
                }
                self.set_state(SyncState::Error {
                    will_retry: connected,
                });
            }
        }
        result
    }

    async fn pull_and_apply(&self) -> Result<CycleOutcome, SyncError> {
        let watermark = self.replica.lock().watermark();
        let timeout = Duration::from_millis(self.config.pull_timeout_ms);
        let response = tokio::time::timeout(timeout, self.transport.pull(watermark))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let mut replica = self.replica.lock();
        let batch = replica.apply_batch(&response.changes, response.new_watermark)?;
        if let Some(sink) = self.sink.lock().as_mut() {
            if let Err(err) = sink.commit_batch(&batch.rows, response.new_watermark) {
                replica.rollback(batch);
                return Err(err.into());
            }
        }

        Ok(CycleOutcome::Applied {
            changes: response.changes.len(),
            watermark: response.new_watermark,
        })
    }

    fn wipe(&self) -> Result<(), PersistError> {
        self.replica.lock().clear();
        if let Some(sink) = self.sink.lock().as_mut() {
            sink.clear()?;
        }
        info!("replica wiped");
        Ok(())
    }
}
