//! Per-request async lifecycle.
//!
//! An [`AsyncHandle`] is created when a request goes async and is closed
//! exactly once, by whichever comes first of: the request task finishing,
//! the deadline timer firing, or the host reporting an error. The state is a
//! single atomic:
//!
//! ```text
//!   Active ──complete()──────────────────────────────► Closed
//!     │                                                  ▲
//!     └─fire_timeout()/fire_error()─► Completing ────────┘
//!                                     (listeners run)
//! ```
//!
//! Only the caller that moves the lifecycle out of `Active` finalises it, so
//! the response is closed and `on_complete` is delivered once no matter how
//! the paths race. `complete()` on a closed lifecycle returns
//! [`LifecycleError::AlreadyCompleted`]; callers treat that as the expected
//! outcome of the race.

use crate::{
    errors::{LifecycleError, SinkError},
    handle::TaskCanceller,
    model::LifecycleState,
    response::ResponseSink,
};
use async_trait::async_trait;
use futures::FutureExt;
use http::{Method, StatusCode};
use std::{
    error::Error,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Request data the host hands to the handler.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: String,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI without the query string.
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(self.uri.as_str(), |(path, _)| path)
    }
}

/// Error reported by the host through [`AsyncHandle::fire_error`].
pub type HostError = Arc<dyn Error + Send + Sync>;

/// Notification passed to every [`AsyncListener`] callback.
pub struct AsyncEvent {
    handle: Arc<AsyncHandle>,
    error: Option<HostError>,
}

impl AsyncEvent {
    fn new(handle: Arc<AsyncHandle>, error: Option<HostError>) -> Self {
        Self { handle, error }
    }

    pub fn handle(&self) -> &Arc<AsyncHandle> {
        &self.handle
    }

    pub fn request(&self) -> &Request {
        self.handle.request()
    }

    pub fn response(&self) -> &Arc<dyn ResponseSink> {
        self.handle.response()
    }

    pub fn error(&self) -> Option<&(dyn Error + Send + Sync)> {
        self.error.as_deref()
    }
}

/// Observer of one lifecycle, registered through [`AsyncHandle::add_listener`].
///
/// `on_timeout` and `on_error` run while the lifecycle is `Completing` and
/// may write to the response; the lifecycle closes once they return.
#[async_trait]
pub trait AsyncListener: Send + Sync {
    fn on_complete(&self, event: &AsyncEvent);

    async fn on_timeout(&self, event: &AsyncEvent);

    async fn on_error(&self, event: &AsyncEvent);

    fn on_start_async(&self, event: &AsyncEvent);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct AsyncHandle {
    id: u64,
    request: Request,
    response: Arc<dyn ResponseSink>,
    state: AtomicU8,
    listeners: Mutex<Vec<Arc<dyn AsyncListener>>>,
    task: OnceLock<TaskCanceller>,
    task_entered: Mutex<bool>,
    task_exited: CancellationToken,
    timeout: Mutex<Option<Duration>>,
    timer: Mutex<Option<CancellationToken>>,
    closed: CancellationToken,
    span: Span,
}

impl AsyncHandle {
    /// Puts the request/response pair into async mode.
    ///
    /// The deadline is not running until [`arm_timeout`](Self::arm_timeout).
    pub fn begin(
        request: Request,
        response: Arc<dyn ResponseSink>,
        timeout: Option<Duration>,
    ) -> Arc<Self> {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("request", id, path = %request.path());
        span.in_scope(|| tracing::debug!(?timeout, "async lifecycle started"));

        Arc::new(Self {
            id,
            request,
            response,
            state: AtomicU8::new(LifecycleState::Active as u8),
            listeners: Mutex::new(Vec::new()),
            task: OnceLock::new(),
            task_entered: Mutex::new(false),
            task_exited: CancellationToken::new(),
            timeout: Mutex::new(timeout),
            timer: Mutex::new(None),
            closed: CancellationToken::new(),
            span,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn response(&self) -> &Arc<dyn ResponseSink> {
        &self.response
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    pub fn timeout(&self) -> Option<Duration> {
        *lock(&self.timeout)
    }

    pub fn add_listener(&self, listener: Arc<dyn AsyncListener>) {
        lock(&self.listeners).push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn AsyncListener>> {
        lock(&self.listeners).clone()
    }

    /// Records the task processing this request. Only the first call wins.
    pub fn attach_task(&self, canceller: TaskCanceller) -> bool {
        self.task.set(canceller).is_ok()
    }

    /// Cancels the attached task, if any. See [`TaskCanceller::cancel`].
    pub fn cancel_task(&self, interrupt: bool) -> bool {
        self.task
            .get()
            .is_some_and(|task| task.cancel(interrupt))
    }

    /// Called by the request task before its first write. Refused once
    /// `token` is cancelled or the lifecycle has left `Active`, in which
    /// case the task must not touch the response at all.
    pub(crate) fn enter_task(&self, token: &CancellationToken) -> bool {
        let mut entered = lock(&self.task_entered);
        if token.is_cancelled() || !self.is_active() {
            return false;
        }
        *entered = true;
        true
    }

    /// Called by the request task once it can no longer write.
    pub(crate) fn exit_task(&self) {
        self.task_exited.cancel();
    }

    /// Turns the response into a 500 when the request task stopped without
    /// producing its outcome. Does nothing once the lifecycle has left
    /// `Active`: the timeout or error path owns the response then.
    pub(crate) fn fail_unfinished_task(&self) -> bool {
        let _entered = lock(&self.task_entered);
        if !self.is_active() {
            return false;
        }
        if let Err(e) = self.response.reset() {
            tracing::debug!(error = %e, "could not discard partial response");
        }
        if let Err(e) = self.response.set_status(StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::debug!(error = %e, "could not mark unfinished response");
        }
        true
    }

    /// Resolves once the request task can no longer write to the response.
    ///
    /// Cancel the task first: a task that has not entered by then never will,
    /// and this returns at once.
    pub async fn task_stopped(&self) {
        let entered = *lock(&self.task_entered);
        if entered {
            self.task_exited.cancelled().await;
        }
    }

    /// The response as the request task should see it: writes are refused
    /// once `token` is cancelled or the lifecycle has left `Active`.
    pub fn task_response(self: &Arc<Self>, token: CancellationToken) -> GatedResponse {
        GatedResponse {
            handle: Arc::clone(self),
            token,
        }
    }

    /// Starts (or restarts) the deadline timer with the current timeout.
    pub fn arm_timeout(self: &Arc<Self>) {
        let Some(timeout) = self.timeout() else {
            return;
        };

        let token = self.closed.child_token();
        if let Some(previous) = lock(&self.timer).replace(token.clone()) {
            previous.cancel();
        }

        let handle = Arc::downgrade(self);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        if let Some(handle) = handle.upgrade() {
                            handle.fire_timeout().await;
                        }
                    }
                }
            }
            .instrument(self.span.clone()),
        );
    }

    /// Extends the async wait: replaces the timeout, re-arms the timer and
    /// delivers `on_start_async`.
    pub fn extend(self: &Arc<Self>, timeout: Duration) -> Result<(), LifecycleError> {
        if !self.is_active() {
            return Err(LifecycleError::NotActive);
        }
        *lock(&self.timeout) = Some(timeout);
        self.arm_timeout();

        let event = AsyncEvent::new(Arc::clone(self), None);
        for listener in self.listeners() {
            listener.on_start_async(&event);
        }
        Ok(())
    }

    /// Closes the lifecycle.
    ///
    /// While a timeout or error notification is in flight the close is left
    /// to that path and `Ok(())` is returned.
    pub fn complete(self: &Arc<Self>) -> Result<(), LifecycleError> {
        match self.state.compare_exchange(
            LifecycleState::Active as u8,
            LifecycleState::Closed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.finalize();
                Ok(())
            }
            Err(raw) if LifecycleState::from_u8(raw) == LifecycleState::Completing => {
                self.span
                    .in_scope(|| tracing::trace!("complete deferred to in-flight notification"));
                Ok(())
            }
            Err(_) => Err(LifecycleError::AlreadyCompleted),
        }
    }

    /// Host side: the async wait ran past its deadline.
    ///
    /// Returns `false` when the lifecycle was no longer active and the
    /// notification was dropped.
    pub async fn fire_timeout(self: &Arc<Self>) -> bool {
        if !self.begin_completing() {
            return false;
        }
        let event = AsyncEvent::new(Arc::clone(self), None);
        for listener in self.listeners() {
            let delivered = AssertUnwindSafe(listener.on_timeout(&event))
                .catch_unwind()
                .instrument(self.span.clone())
                .await;
            if delivered.is_err() {
                self.span.in_scope(|| tracing::error!("listener panicked in on_timeout"));
            }
        }
        self.finish();
        true
    }

    /// Host side: the container hit an error on this request.
    pub async fn fire_error(self: &Arc<Self>, error: Option<HostError>) -> bool {
        if !self.begin_completing() {
            return false;
        }
        let event = AsyncEvent::new(Arc::clone(self), error);
        for listener in self.listeners() {
            let delivered = AssertUnwindSafe(listener.on_error(&event))
                .catch_unwind()
                .instrument(self.span.clone())
                .await;
            if delivered.is_err() {
                self.span.in_scope(|| tracing::error!("listener panicked in on_error"));
            }
        }
        self.finish();
        true
    }

    /// Resolves once the lifecycle is closed and listeners have been told.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn begin_completing(&self) -> bool {
        self.state
            .compare_exchange(
                LifecycleState::Active as u8,
                LifecycleState::Completing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn finish(self: &Arc<Self>) {
        self.state
            .store(LifecycleState::Closed as u8, Ordering::Release);
        self.finalize();
    }

    fn finalize(self: &Arc<Self>) {
        let _enter = self.span.enter();

        if let Err(e) = self.response.close() {
            tracing::debug!(error = %e, "response close failed");
        }

        let event = AsyncEvent::new(Arc::clone(self), None);
        for listener in self.listeners() {
            listener.on_complete(&event);
        }

        self.closed.cancel();
    }
}

impl fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("state", &self.state())
            .field("timeout", &self.timeout())
            .finish_non_exhaustive()
    }
}

/// View of the response handed to the request task.
///
/// Every operation fails with [`SinkError::Interrupted`] once the task's
/// token is cancelled and with [`SinkError::Closed`] once the lifecycle is no
/// longer `Active`, so a task that keeps running after a timeout cannot write
/// over the timeout response.
pub struct GatedResponse {
    handle: Arc<AsyncHandle>,
    token: CancellationToken,
}

impl GatedResponse {
    fn check(&self) -> Result<(), SinkError> {
        if self.token.is_cancelled() {
            return Err(SinkError::Interrupted);
        }
        if !self.handle.is_active() {
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    fn inner(&self) -> &dyn ResponseSink {
        self.handle.response().as_ref()
    }
}

#[async_trait]
impl ResponseSink for GatedResponse {
    fn set_status(&self, status: StatusCode) -> Result<(), SinkError> {
        self.check()?;
        self.inner().set_status(status)
    }

    fn set_header(&self, name: &str, value: &str) -> Result<(), SinkError> {
        self.check()?;
        self.inner().set_header(name, value)
    }

    fn append(&self, text: &str) -> Result<(), SinkError> {
        self.check()?;
        self.inner().append(text)
    }

    fn reset(&self) -> Result<(), SinkError> {
        self.check()?;
        self.inner().reset()
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SinkError::Interrupted),
            res = self.inner().flush() => res,
        }
    }

    async fn redirect(&self, location: &str) -> Result<(), SinkError> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SinkError::Interrupted),
            res = self.inner().redirect(location) => res,
        }
    }

    async fn send_error(&self, status: StatusCode, message: &str) -> Result<(), SinkError> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SinkError::Interrupted),
            res = self.inner().send_error(status, message) => res,
        }
    }

    fn is_committed(&self) -> bool {
        self.inner().is_committed()
    }

    /// Closing the task's view completes the lifecycle.
    fn close(&self) -> Result<(), SinkError> {
        self.handle.complete().map_err(|_| SinkError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::BufferedResponse;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        completed: AtomicUsize,
        started: AtomicUsize,
    }

    #[async_trait]
    impl AsyncListener for Counting {
        fn on_complete(&self, _event: &AsyncEvent) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_timeout(&self, _event: &AsyncEvent) {}

        async fn on_error(&self, _event: &AsyncEvent) {}

        fn on_start_async(&self, _event: &AsyncEvent) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn path_drops_query_string() {
        assert_eq!(Request::get("/app/echo?x=1").path(), "/app/echo");
        assert_eq!(Request::get("/app/echo").path(), "/app/echo");
    }

    #[test]
    fn second_complete_is_reported_not_repeated() {
        let sink = Arc::new(BufferedResponse::new());
        let handle = AsyncHandle::begin(Request::get("/a"), sink.clone(), None);
        let listener = Arc::new(Counting::default());
        handle.add_listener(listener.clone());

        assert_eq!(handle.complete(), Ok(()));
        assert_eq!(handle.complete(), Err(LifecycleError::AlreadyCompleted));
        assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
        assert!(sink.snapshot().closed);
    }

    #[tokio::test]
    async fn notifications_after_close_are_dropped() {
        let handle = AsyncHandle::begin(
            Request::get("/a"),
            Arc::new(BufferedResponse::new()),
            None,
        );
        handle.complete().unwrap();
        assert!(!handle.fire_timeout().await);
        assert!(!handle.fire_error(None).await);
        assert_eq!(handle.extend(Duration::from_secs(1)), Err(LifecycleError::NotActive));
    }

    #[tokio::test]
    async fn gated_response_refuses_writes_after_close() {
        let sink = Arc::new(BufferedResponse::new());
        let handle = AsyncHandle::begin(Request::get("/a"), sink.clone(), None);
        let token = CancellationToken::new();
        let gated = handle.task_response(token.clone());

        gated.append("early").unwrap();
        token.cancel();
        assert!(matches!(gated.append("x"), Err(SinkError::Interrupted)));

        let gated = handle.task_response(CancellationToken::new());
        handle.complete().unwrap();
        assert!(matches!(gated.flush().await, Err(SinkError::Closed)));
        assert_eq!(sink.snapshot().body, "early");
    }
}
