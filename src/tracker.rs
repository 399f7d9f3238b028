use crate::lifecycle::{AsyncEvent, AsyncListener};
use async_trait::async_trait;
use http::StatusCode;
use tracing::{Instrument, Span};

/// Listener attached to every request the coordinator hands off.
///
/// Reconciles host notifications with the request task: on timeout or error
/// the task is interrupted, and once it has stopped writing any uncommitted
/// output is replaced by a substitute status. A response the task already
/// committed is logged and left as it is.
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    span: Span,
}

impl CompletionTracker {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    async fn substitute(&self, event: &AsyncEvent, status: StatusCode) {
        event.handle().task_stopped().await;

        let response = event.response().as_ref();
        if let Err(e) = response.reset() {
            tracing::debug!(error = %e, "response already committed, output left as is");
        }
        if let Err(e) = response.set_status(status) {
            tracing::debug!(error = %e, %status, "response already committed, status left as is");
        }
        if let Err(e) = response.flush().await {
            tracing::debug!(error = %e, "flush after notification failed");
        }
    }
}

#[async_trait]
impl AsyncListener for CompletionTracker {
    fn on_complete(&self, _event: &AsyncEvent) {
        self.span.in_scope(|| tracing::info!("Async request completed"));
    }

    async fn on_timeout(&self, event: &AsyncEvent) {
        let path = event.request().path();
        self.span.in_scope(|| {
            match event.error() {
                Some(err) => tracing::warn!(error = %err, "Async request timed out for {path}"),
                None => tracing::warn!("Async request timed out for {path}"),
            }
            if event.handle().cancel_task(true) {
                tracing::debug!("interrupted request task");
            }
        });

        self.substitute(event, StatusCode::REQUEST_TIMEOUT)
            .instrument(self.span.clone())
            .await;
    }

    async fn on_error(&self, event: &AsyncEvent) {
        let path = event.request().path();
        self.span.in_scope(|| {
            match event.error() {
                Some(err) => tracing::error!(error = %err, "Async request error for {path}"),
                None => tracing::error!("Async request error for {path}"),
            }
            event.handle().cancel_task(true);
        });

        self.substitute(event, StatusCode::INTERNAL_SERVER_ERROR)
            .instrument(self.span.clone())
            .await;

        // Notifications run while the lifecycle is completing, so the close
        // is deferred until every listener has returned.
        match event.handle().complete() {
            Ok(()) => self
                .span
                .in_scope(|| tracing::debug!("close deferred until error delivery ends")),
            Err(e) => self
                .span
                .in_scope(|| tracing::debug!(error = %e, "lifecycle close refused")),
        }
    }

    fn on_start_async(&self, _event: &AsyncEvent) {
        self.span.in_scope(|| tracing::info!("Async event started"));
    }
}
