use std::future::Future;

use crate::{
    runtime::handle::{RuntimeError, ServerHandle},
    sync::endpoint::PullResponse,
    types::Revision,
};

/// Failure to reach the server. Always safe to retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server rejected or failed the request.
    #[error("server unavailable: {0}")]
    Unavailable(String),
    /// The pull exceeded its deadline.
    #[error("pull timed out")]
    Timeout,
    /// The server is gone.
    #[error("server channel closed")]
    ChannelClosed,
}

/// Carries pull requests to the server.
pub trait PullTransport: Send + Sync + 'static {
    /// Requests every compacted change after `watermark`.
    fn pull(&self, watermark: Option<Revision>) -> impl Future<Output = Result<PullResponse, TransportError>> + Send;
}

impl PullTransport for ServerHandle {
    async fn pull(&self, watermark: Option<Revision>) -> Result<PullResponse, TransportError> {
        ServerHandle::pull(self, watermark).await.map_err(|err| match err {
            RuntimeError::ChannelClosed => TransportError::ChannelClosed,
            other => TransportError::Unavailable(other.to_string()),
        })
    }
}
