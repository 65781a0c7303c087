//! Unit-of-work handler contract

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::persistence::TaskQueueEntry;

/// Failure reported by a handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    /// Transient failure; the entry is re-queued while attempts remain
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent failure; the entry is failed immediately
    #[error("terminal: {0}")]
    Terminal(String),
}

impl WorkError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(message) | Self::Terminal(message) => message,
        }
    }
}

/// Handler execution result
pub type WorkResult = Result<(), WorkError>;

/// Handler function type
///
/// Receives the claimed entry (its `work_ref` points at the payload) and
/// resolves to a success/failure outcome.
pub type WorkHandler = Arc<
    dyn Fn(TaskQueueEntry) -> Pin<Box<dyn Future<Output = WorkResult> + Send>> + Send + Sync,
>;

/// Wrap an async closure as a [`WorkHandler`]
pub fn handler_fn<F, Fut>(handler: F) -> WorkHandler
where
    F: Fn(TaskQueueEntry) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    Arc::new(move |entry| Box::pin(handler(entry)))
}
