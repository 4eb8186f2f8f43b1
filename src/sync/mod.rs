//! Changelog compaction and the pull endpoint.

/// Reduces a row's history within a revision window to one net change.
pub mod compactor;
/// Builds compacted pull responses from the changelog.
pub mod endpoint;
