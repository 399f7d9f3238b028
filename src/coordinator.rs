//! Hands a request off to background processing.

use crate::{
    errors::DispatchError,
    handle::{spawn_detached, TaskHandle},
    lifecycle::{AsyncHandle, Request},
    pool::ThreadPool,
    response::ResponseSink,
    task::RequestTask,
    tracker::CompletionTracker,
};
use std::{sync::Arc, time::Duration};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline for the async wait. `None` disables the timer.
    pub async_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            async_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Where request tasks run.
#[derive(Clone)]
pub enum Strategy {
    /// One fresh tokio task per request.
    Direct,
    /// Submitted to a shared bounded pool.
    Pooled(ThreadPool),
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Pooled(_) => "pooled",
        }
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct AsyncCoordinator {
    strategy: Strategy,
    config: CoordinatorConfig,
}

impl AsyncCoordinator {
    pub fn new(strategy: Strategy, config: CoordinatorConfig) -> Self {
        Self { strategy, config }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Puts the request into async mode and dispatches its processing.
    ///
    /// Returns as soon as the task is handed off; the caller never waits for
    /// the response. Must be called from within a tokio runtime. When the
    /// pool refuses the task the lifecycle is still closed, with a 500.
    pub fn service(
        &self,
        request: Request,
        response: Arc<dyn ResponseSink>,
    ) -> Result<Arc<AsyncHandle>, DispatchError> {
        let handle = AsyncHandle::begin(request, response, self.config.async_timeout);
        handle.add_listener(Arc::new(CompletionTracker::new(handle.span().clone())));

        let task = RequestTask::new(Arc::clone(&handle));
        let dispatched: Result<TaskHandle<()>, _> = match &self.strategy {
            Strategy::Direct => Ok(spawn_detached(move |token| task.run(token))),
            Strategy::Pooled(pool) => pool.submit(move |token| task.run(token)),
        };

        match dispatched {
            Ok(task) => {
                handle.attach_task(task.canceller());
                handle.arm_timeout();
                handle.span().in_scope(|| {
                    tracing::debug!(strategy = self.strategy.name(), "request task dispatched")
                });
                Ok(handle)
            }
            Err(e) => {
                handle
                    .span()
                    .in_scope(|| tracing::error!(error = %e, "request task rejected"));
                Err(DispatchError::Rejected(e))
            }
        }
    }
}
