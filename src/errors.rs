use thiserror::Error;

/// Failure of a unit of work submitted to the pool or spawned directly.
#[derive(Debug, Error, PartialEq, PartialOrd, Eq, Ord, Clone)]
pub enum SpawnError {
    #[error("join failed: {0}")]
    JoinFailed(String),
    #[error("task panicked: {0}")]
    Panic(String),
    #[error("result channel closed")]
    ChannelClosed,
    #[error("timed out waiting for task")]
    Timeout,
    #[error("task cancelled")]
    Cancelled,
    #[error("worker pool is shut down")]
    Shutdown,
}

/// Failure reported by a [`ResponseSink`](crate::response::ResponseSink).
///
/// `Committed` and `Closed` are expected when the task and the tracker race
/// for the same response and are logged, not propagated.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("response already committed")]
    Committed,
    #[error("response closed")]
    Closed,
    #[error("write interrupted by cancellation")]
    Interrupted,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Whether this error came from the task being cancelled.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum LifecycleError {
    #[error("async lifecycle already completed")]
    AlreadyCompleted,
    #[error("async lifecycle is not active")]
    NotActive,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DispatchError {
    #[error("request task rejected: {0}")]
    Rejected(#[from] SpawnError),
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("core_workers must be at least 1")]
    NoCoreWorkers,
    #[error("max_workers ({max}) must be >= core_workers ({core})")]
    MaxBelowCore { core: usize, max: usize },
}
