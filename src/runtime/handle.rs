use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    change::ChangeRecord,
    core::{
        mutation::Mutation,
        store::{EntityStore, MutationOutcome, StoreError},
    },
    entity::Row,
    persist::{ChangeSink, PersistError},
    sync::endpoint::{self, PullResponse},
    types::{ActorId, Revision, Table},
};

use super::events::ServerEvent;

/// Failure of a [`ServerHandle`] call.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The mutation was rejected.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The journal append failed and the mutation was rolled back.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The server loop has stopped.
    #[error("server runtime channel closed")]
    ChannelClosed,
}

/// Tuning for [`spawn_server`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Commands buffered before callers wait.
    pub command_queue_bound: usize,
    /// Events buffered per subscriber before it lags.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command_queue_bound: 256,
            event_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Parses a JSON config; missing keys keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets [`ServerConfig::command_queue_bound`].
    pub fn with_command_queue_bound(mut self, bound: usize) -> Self {
        self.command_queue_bound = bound;
        self
    }

    /// Sets [`ServerConfig::event_capacity`].
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Cloneable handle to the server loop.
#[derive(Clone)]
pub struct ServerHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<ServerEvent>,
}

enum Command {
    Mutate {
        actor: ActorId,
        mutation: Mutation,
        resp: oneshot::Sender<Result<MutationOutcome, RuntimeError>>,
    },
    Get {
        table: Table,
        key: String,
        resp: oneshot::Sender<Option<Row>>,
    },
    LatestRevision {
        resp: oneshot::Sender<Revision>,
    },
    ReadWindow {
        from: Revision,
        resp: oneshot::Sender<(Vec<ChangeRecord>, Revision)>,
    },
    Flush {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

type SharedSink = Arc<Mutex<Box<dyn ChangeSink>>>;

/// Spawns the single-writer server loop that owns `store`.
///
/// With a sink, every transaction is journaled before it becomes visible; a
/// journal failure rolls the mutation back.
pub fn spawn_server(
    store: EntityStore,
    sink: Option<Box<dyn ChangeSink>>,
    config: ServerConfig,
) -> ServerHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<ServerEvent>(config.event_capacity.max(1));
    let sink: Option<SharedSink> = sink.map(|s| Arc::new(Mutex::new(s)));

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut store = store;
        while let Some(cmd) = cmd_rx.recv().await {
            let done = handle_command(cmd, &mut store, &events_tx_loop, sink.as_ref()).await;
            if done {
                break;
            }
        }
        debug!(revision = store.latest_revision(), "server loop stopped");
    });

    ServerHandle { cmd_tx, events_tx }
}

impl ServerHandle {
    /// Receiver of commit events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    /// Runs `mutation` on behalf of `actor` as one atomic transaction.
    pub async fn mutate(&self, actor: ActorId, mutation: Mutation) -> Result<MutationOutcome, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Mutate {
                actor,
                mutation,
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Current contents of one row.
    pub async fn get(&self, table: Table, key: impl Into<String>) -> Result<Option<Row>, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Get {
                table,
                key: key.into(),
                resp: tx,
            })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Highest committed revision.
    pub async fn latest_revision(&self) -> Result<Revision, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::LatestRevision { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Compacted changes since `watermark`.
    ///
    /// The server loop only fixes the upper bound and copies the raw window;
    /// compaction runs on the caller's task so writers are not held up.
    pub async fn pull(&self, watermark: Option<Revision>) -> Result<PullResponse, RuntimeError> {
        let from = endpoint::from_revision(watermark);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReadWindow { from, resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        let (window, new_watermark) = rx.await.map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(endpoint::build_response(&window, from, new_watermark))
    }

    /// Flushes the journal, if any.
    pub async fn flush(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }

    /// Flushes the journal and stops the server loop.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)?
    }
}

async fn handle_command(
    cmd: Command,
    store: &mut EntityStore,
    events_tx: &broadcast::Sender<ServerEvent>,
    sink: Option<&SharedSink>,
) -> bool {
    match cmd {
        Command::Mutate {
            actor,
            mutation,
            resp,
        } => {
            let res = run_mutation(store, sink, &actor, &mutation).await;
            if let Ok(outcome) = &res {
                for change in &outcome.changes {
                    let _ = events_tx.send(ServerEvent::Committed {
                        revision: change.revision,
                        table: change.table,
                        key: change.key.clone(),
                        kind: change.kind,
                    });
                }
            }
            let _ = resp.send(res);
        }
        Command::Get { table, key, resp } => {
            let _ = resp.send(store.get(table, &key).cloned());
        }
        Command::LatestRevision { resp } => {
            let _ = resp.send(store.latest_revision());
        }
        Command::ReadWindow { from, resp } => {
            let upto = store.latest_revision();
            let window = store.changelog().range(from, upto).to_vec();
            let _ = resp.send((window, upto));
        }
        Command::Flush { resp } => {
            let out = match sink {
                Some(sink) => flush_sink(sink).await,
                None => Ok(()),
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = match sink {
                Some(sink) => flush_sink(sink).await,
                None => Ok(()),
            };
            let _ = resp.send(out);
            return true;
        }
    }

    false
}

async fn run_mutation(
    store: &mut EntityStore,
    sink: Option<&SharedSink>,
    actor: &ActorId,
    mutation: &Mutation,
) -> Result<MutationOutcome, RuntimeError> {
    let staged = store.stage(actor, mutation)?;

    if let Some(sink) = sink {
        if !staged.is_noop() {
            let records = staged.records().to_vec();
            let sink_ref = Arc::clone(sink);
            let appended = tokio::task::spawn_blocking(move || {
                let mut sink = sink_ref.blocking_lock();
                sink.append_changes(&records)
            })
            .await
            .map_err(|e| PersistError::Message(format!("join error: {e}")))
            .and_then(|r| r);
            if let Err(err) = appended {
                warn!(error = %err, "journal append failed, mutation rolled back");
                return Err(err.into());
            }
        }
    }

    Ok(store.commit(staged)?)
}

async fn flush_sink(sink: &SharedSink) -> Result<(), RuntimeError> {
    let sink_ref = Arc::clone(sink);
    tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        sink.flush()
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))??;
    Ok(())
}
