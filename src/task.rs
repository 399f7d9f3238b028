//! Request processing run off the accepting thread.

use crate::{
    errors::SinkError,
    lifecycle::AsyncHandle,
    response::ResponseSink,
};
use futures::FutureExt;
use http::{header, StatusCode};
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const REDIRECT_LOCATION: &str = "http://tomcat.apache.org";
pub const BAD_REQUEST_MESSAGE: &str = "Sorry, that was a bad request.";

/// The canned responses, picked by request path suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `.../redirect1`: high-level redirect.
    Redirect,
    /// `.../redirect2`: 302 and `Location` set by hand, nothing committed.
    Found,
    /// `.../error1`: high-level error response.
    SendError,
    /// `.../error2`: 400 with the message written as the body.
    BadRequestBody,
    /// Anything else: echo the path.
    Echo(String),
}

impl Outcome {
    /// First matching suffix wins.
    pub fn select(path: &str) -> Self {
        if path.ends_with("/redirect1") {
            Self::Redirect
        } else if path.ends_with("/redirect2") {
            Self::Found
        } else if path.ends_with("/error1") {
            Self::SendError
        } else if path.ends_with("/error2") {
            Self::BadRequestBody
        } else {
            Self::Echo(path.to_string())
        }
    }

    pub async fn write_to(&self, response: &dyn ResponseSink) -> Result<(), SinkError> {
        match self {
            Self::Redirect => {
                tracing::info!("Redirecting using redirect");
                response.redirect(REDIRECT_LOCATION).await
            }
            Self::Found => {
                tracing::info!("Redirecting using status and header");
                response.set_status(StatusCode::FOUND)?;
                response.set_header(header::LOCATION.as_str(), REDIRECT_LOCATION)
            }
            Self::SendError => {
                tracing::info!("Sending error response using send_error");
                response
                    .send_error(StatusCode::BAD_REQUEST, BAD_REQUEST_MESSAGE)
                    .await
            }
            Self::BadRequestBody => {
                tracing::info!("Sending error response using status");
                response.set_status(StatusCode::BAD_REQUEST)?;
                response.append(BAD_REQUEST_MESSAGE)?;
                response.append("\n")?;
                response.flush().await
            }
            Self::Echo(path) => {
                tracing::info!("Sending a response");
                response.append(&format!("You requested: {path}\n"))?;
                response.flush().await
            }
        }
    }
}

/// Closes the lifecycle when dropped.
///
/// Lives inside [`RequestTask`] so the close happens on every exit: normal
/// return, fault, interrupt, or the task being discarded before it ran. A
/// task that did not get to write its outcome leaves a 500 behind, unless a
/// timeout or error notification already owns the response.
pub struct CompletionGuard {
    handle: Arc<AsyncHandle>,
    started: bool,
    finished: bool,
}

impl CompletionGuard {
    fn new(handle: Arc<AsyncHandle>) -> Self {
        Self {
            handle,
            started: false,
            finished: false,
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let _enter = self.handle.span().enter();

        if !self.finished && self.handle.fail_unfinished_task() {
            if self.started {
                tracing::warn!("request task stopped before finishing");
            } else {
                tracing::warn!("request task abandoned before it ran");
            }
        }

        self.handle.exit_task();
        if let Err(e) = self.handle.complete() {
            tracing::debug!(error = %e, "lifecycle already closed");
        }
    }
}

/// Processing of one request, bound to its lifecycle.
pub struct RequestTask {
    handle: Arc<AsyncHandle>,
    guard: CompletionGuard,
}

impl RequestTask {
    pub fn new(handle: Arc<AsyncHandle>) -> Self {
        Self {
            guard: CompletionGuard::new(Arc::clone(&handle)),
            handle,
        }
    }

    /// Writes the outcome for the request path, then closes the lifecycle.
    ///
    /// Faults are handled here and never propagate: the response is turned
    /// into a 500 and flushed best-effort.
    pub async fn run(self, token: CancellationToken) {
        let span = self.handle.span().clone();
        self.run_inner(token).instrument(span).await
    }

    async fn run_inner(mut self, token: CancellationToken) {
        self.guard.started = true;
        if !self.handle.enter_task(&token) {
            tracing::debug!("request task cancelled before writing");
            return;
        }

        let path = self.handle.request().path().to_string();
        tracing::info!("Handling request for {path} in async mode");

        let response = self.handle.task_response(token);
        let outcome = Outcome::select(&path);

        let result = AssertUnwindSafe(outcome.write_to(&response))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => self.guard.finished = true,
            Ok(Err(e)) if e.is_interrupted() => {
                tracing::debug!("request task interrupted");
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Async task failed");
                Self::recover(&response).await;
                self.guard.finished = true;
            }
            Err(_) => {
                tracing::error!("Async task panicked");
                Self::recover(&response).await;
                self.guard.finished = true;
            }
        }
        // `self.guard` drops here and closes the lifecycle.
    }

    async fn recover(response: &dyn ResponseSink) {
        if let Err(e) = response.reset() {
            tracing::debug!(error = %e, "could not discard partial response");
        }
        if let Err(e) = response.set_status(StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::debug!(error = %e, "could not set 500 status");
        }
        if let Err(e) = response.flush().await {
            tracing::warn!(error = %e, "Failed to flush response writer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_are_checked_in_priority_order() {
        assert_eq!(Outcome::select("/app/redirect1"), Outcome::Redirect);
        assert_eq!(Outcome::select("/app/redirect2"), Outcome::Found);
        assert_eq!(Outcome::select("/app/error1"), Outcome::SendError);
        assert_eq!(Outcome::select("/app/error2"), Outcome::BadRequestBody);
        assert_eq!(
            Outcome::select("/app/anything-else"),
            Outcome::Echo("/app/anything-else".to_string())
        );
    }

    #[test]
    fn suffix_must_be_a_whole_segment() {
        assert_eq!(
            Outcome::select("/app/myredirect1"),
            Outcome::Echo("/app/myredirect1".to_string())
        );
        assert_eq!(
            Outcome::select("/app/error1/more"),
            Outcome::Echo("/app/error1/more".to_string())
        );
        assert_eq!(Outcome::select("/redirect1"), Outcome::Redirect);
    }
}
