//! Warehouse stock tables with a revision-based changelog and compacted
//! client sync.
//!
//! Every committed mutation appends change records under a global revision.
//! Clients pull the net effect of everything after their watermark, one
//! record per changed row, and apply it to a local [`client::replica::Replica`].
//!
//! # Examples
//!
//! In-memory usage with [`core::store::EntityStore`]:
//! ```
//! use stocksync::{
//!     core::{mutation::Mutation, store::EntityStore},
//!     entity::StorageDraft,
//!     sync::endpoint::pull,
//!     types::ActorId,
//! };
//!
//! let mut store = EntityStore::new();
//! let actor = ActorId::new("alice");
//! let created = store
//!     .apply(&actor, &Mutation::CreateStorage(StorageDraft {
//!         name: "Main".to_string(),
//!         description: None,
//!     }))
//!     .expect("create");
//! assert_eq!(created.changes[0].revision, 1);
//!
//! let response = pull(store.changelog(), None);
//! assert_eq!(response.new_watermark, 1);
//! ```
//!
//! Server runtime with a SQLite journal and a syncing client:
//! ```no_run
//! use stocksync::{
//!     client::scheduler::{ClientConfig, SyncClient},
//!     core::{mutation::Mutation, store::EntityStore},
//!     entity::StorageDraft,
//!     persist::sqlite::SqliteChangeSink,
//!     runtime::handle::{spawn_server, ServerConfig},
//!     types::ActorId,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteChangeSink::open("stock.db").expect("open sqlite");
//! let store = sink.load_store().expect("replay");
//! let server = spawn_server(store, Some(Box::new(sink)), ServerConfig::default());
//! server
//!     .mutate(ActorId::new("alice"), Mutation::CreateStorage(StorageDraft {
//!         name: "Main".to_string(),
//!         description: None,
//!     }))
//!     .await
//!     .expect("create");
//!
//! let client = SyncClient::new(server.clone(), ClientConfig::default());
//! client.connect().await.expect("connect");
//! client.disconnect();
//! server.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Change record model and persistence wrappers.
pub mod change;
/// Client replica, transport, and sync scheduler.
pub mod client;
/// Core in-memory store, changelog, and index helpers.
pub mod core;
/// Entity rows, drafts, and patches.
pub mod entity;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Single-writer server runtime and events.
pub mod runtime;
/// Compaction and the pull endpoint.
pub mod sync;
/// Shared primitive types and enums.
pub mod types;
