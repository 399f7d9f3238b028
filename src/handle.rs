use super::{
    errors::SpawnError,
    model::{JobStatus, TaskState},
    result::SpawnResult,
};
use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use futures::FutureExt;
use tokio::{
    sync::oneshot,
    time::Duration,
};
use tokio_util::sync::CancellationToken;


/// Type-erased unit of work as it sits in the pool queue.
pub type Task = Pin<Box<dyn Future<Output = JobStatus> + Send + 'static>>;

/// State shared between a queued/running unit and every handle to it.
pub(crate) struct TaskControl {
    state: AtomicU8,
    token: CancellationToken,
}

impl TaskControl {
    fn new(token: CancellationToken) -> Self {
        Self {
            state: AtomicU8::new(TaskState::Queued as u8),
            token,
        }
    }

    #[inline]
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancel(&self, interrupt: bool) -> bool {
        if self.transition(TaskState::Queued, TaskState::Cancelled)
            || (interrupt && self.transition(TaskState::Running, TaskState::Cancelled))
        {
            self.token.cancel();
            return true;
        }
        false
    }

    fn mark_cancelled(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (TaskState::from_u8(raw) != TaskState::Finished)
                    .then_some(TaskState::Cancelled as u8)
            });
    }

    fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled || self.token.is_cancelled()
    }
}

impl fmt::Debug for TaskControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskControl")
            .field("state", &self.state())
            .field("token_cancelled", &self.token.is_cancelled())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic in spawned task".to_string()
    }
}

/// Wraps `f` into a queueable [`Task`] plus the handle observing it.
///
/// `f` receives the unit's cancellation token. The future it returns is raced
/// against that token, so an interrupt drops it at its next await point.
pub(crate) fn task<T, F, Fut>(token: CancellationToken, f: F) -> (TaskHandle<T>, Task)
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel::<SpawnResult<T>>();
    let control = Arc::new(TaskControl::new(token));
    let job_control = Arc::clone(&control);

    let job: Task = Box::pin(async move {
        let control = job_control;
        if control.token.is_cancelled()
            || !control.transition(TaskState::Queued, TaskState::Running)
        {
            control.mark_cancelled();
            let _ = tx.send(Err(SpawnError::Cancelled));
            return JobStatus::Cancelled;
        }

        let fut = f(control.token.clone());
        let result: SpawnResult<T> = tokio::select! {
            biased;
            _ = control.token.cancelled() => Err(SpawnError::Cancelled),
            res = AssertUnwindSafe(fut).catch_unwind() => {
                res.map_err(|payload| SpawnError::Panic(panic_message(&*payload)))
            }
        };

        let result = match result {
            Ok(value) if control.transition(TaskState::Running, TaskState::Finished) => Ok(value),
            Ok(_) | Err(SpawnError::Cancelled) => {
                control.mark_cancelled();
                Err(SpawnError::Cancelled)
            }
            Err(err) => {
                control.transition(TaskState::Running, TaskState::Finished);
                Err(err)
            }
        };

        let status = match &result {
            Ok(_) => JobStatus::Completed,
            Err(SpawnError::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };
        let _ = tx.send(result);
        status
    });

    (TaskHandle::new(control, rx), job)
}

/// Runs `f` on its own tokio task instead of a pool worker.
pub fn spawn_detached<T, F, Fut>(f: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let (handle, job) = task(CancellationToken::new(), f);
    tokio::spawn(job);
    handle
}


/// Handle to a submitted unit, with cancellation and timeout support.
pub struct TaskHandle<T> {
    control: Arc<TaskControl>,
    receiver: oneshot::Receiver<SpawnResult<T>>,
}

impl<T> TaskHandle<T> {

    pub(crate) fn new(
        control: Arc<TaskControl>,
        receiver: oneshot::Receiver<SpawnResult<T>>,
    ) -> Self {
        Self {
            control,
            receiver,
        }
    }

    /// Cancels the unit. A queued unit is always cancelled; a running one
    /// only when `interrupt` is set. Returns `false` if it already finished
    /// or was already cancelled.
    #[inline]
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.control.cancel(interrupt)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.control.state() == TaskState::Cancelled
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.control.state(), TaskState::Finished | TaskState::Cancelled)
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    pub fn canceller(&self) -> TaskCanceller {
        TaskCanceller {
            control: Arc::clone(&self.control),
        }
    }

    pub async fn await_timeout(self, timeout: Duration) -> SpawnResult<T> {
        tokio::time::timeout(timeout, self)
            .await
            .unwrap_or(Err(SpawnError::Timeout))
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = SpawnResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            // The unit was dropped without reporting, e.g. discarded from the
            // queue by a pool shutdown.
            Poll::Ready(Err(_)) if this.control.is_cancelled() => {
                Poll::Ready(Err(SpawnError::Cancelled))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(SpawnError::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("control", &self.control).finish()
    }
}

/// Cancel-only view of a [`TaskHandle`], detachable from the result.
#[derive(Clone, Debug)]
pub struct TaskCanceller {
    control: Arc<TaskControl>,
}

impl TaskCanceller {
    #[inline]
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.control.cancel(interrupt)
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.control.state()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.control.state() == TaskState::Cancelled
    }
}
