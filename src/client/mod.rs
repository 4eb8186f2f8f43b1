//! Client-side replica, transport seam, and sync scheduler.

/// Local mirror of the server tables.
pub mod replica;
/// Pull cycle state machine and periodic scheduler.
pub mod scheduler;
/// Transport abstraction between client and server.
pub mod transport;
