//! In-memory authoritative store, changelog, and index helpers.

/// Append-only revision log.
pub mod changelog;
/// Helper index aliases.
pub mod indices;
/// Typed mutation commands.
pub mod mutation;
/// Authoritative entity tables with staged, logged transactions.
pub mod store;
