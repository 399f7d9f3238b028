//! Response-writing contract supplied by the host server.
//!
//! [`ResponseSink`] is what the request task and the completion tracker write
//! through. Both may touch the same sink from different threads, so every
//! operation takes `&self` and failures caused by the other party having
//! committed or closed the response are reported as [`SinkError::Committed`]
//! or [`SinkError::Closed`] for the caller to log and drop.
//!
//! [`BufferedResponse`] is an in-memory host implementation: it records what
//! would have reached the client, which is what tests and the demo binary
//! inspect.

use crate::errors::SinkError;
use async_trait::async_trait;
use http::{header, HeaderValue, StatusCode};
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait ResponseSink: Send + Sync {
    fn set_status(&self, status: StatusCode) -> Result<(), SinkError>;

    fn set_header(&self, name: &str, value: &str) -> Result<(), SinkError>;

    /// Appends body text to the pending buffer.
    fn append(&self, text: &str) -> Result<(), SinkError>;

    /// Discards the uncommitted status, headers and body.
    fn reset(&self) -> Result<(), SinkError>;

    /// Sends everything buffered so far. The first flush commits status and
    /// headers.
    async fn flush(&self) -> Result<(), SinkError>;

    /// Sends a 302 to `location` and commits the response.
    async fn redirect(&self, location: &str) -> Result<(), SinkError>;

    /// Replaces any pending body with an error response and commits it.
    async fn send_error(&self, status: StatusCode, message: &str) -> Result<(), SinkError>;

    fn is_committed(&self) -> bool;

    /// Finishes the response. Called once by the lifecycle when it closes;
    /// must tolerate being called on an already closed sink.
    fn close(&self) -> Result<(), SinkError>;
}

/// What reached the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub error_message: Option<String>,
    pub committed: bool,
    pub closed: bool,
    pub flushes: usize,
}

impl ResponseSnapshot {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug)]
struct BufferedState {
    status: StatusCode,
    headers: Vec<(String, String)>,
    pending: String,
    sent: ResponseSnapshot,
}

impl BufferedState {
    fn writable(&self) -> Result<(), SinkError> {
        if self.sent.closed {
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    fn uncommitted(&self) -> Result<(), SinkError> {
        self.writable()?;
        if self.sent.committed {
            return Err(SinkError::Committed);
        }
        Ok(())
    }

    fn commit(&mut self) {
        if !self.sent.committed {
            self.sent.status = self.status;
            self.sent.headers = self.headers.clone();
            self.sent.committed = true;
        }
        let pending = std::mem::take(&mut self.pending);
        self.sent.body.push_str(&pending);
    }

    fn flush(&mut self) {
        self.commit();
        self.sent.flushes += 1;
    }
}

/// In-memory [`ResponseSink`] standing in for a real connection.
#[derive(Debug)]
pub struct BufferedResponse {
    state: Mutex<BufferedState>,
}

impl Default for BufferedResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferedState {
                status: StatusCode::OK,
                headers: Vec::new(),
                pending: String::new(),
                sent: ResponseSnapshot {
                    status: StatusCode::OK,
                    headers: Vec::new(),
                    body: String::new(),
                    error_message: None,
                    committed: false,
                    closed: false,
                    flushes: 0,
                },
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> ResponseSnapshot {
        self.lock().sent.clone()
    }

    /// Status as the writer currently sees it, committed or not.
    pub fn status(&self) -> StatusCode {
        self.lock().status
    }
}

#[async_trait]
impl ResponseSink for BufferedResponse {
    fn set_status(&self, status: StatusCode) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.uncommitted()?;
        state.status = status;
        Ok(())
    }

    fn set_header(&self, name: &str, value: &str) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.uncommitted()?;
        match state
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => state.headers.push((name.to_string(), value.to_string())),
        }
        Ok(())
    }

    fn append(&self, text: &str) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.writable()?;
        state.pending.push_str(text);
        Ok(())
    }

    fn reset(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.uncommitted()?;
        state.status = StatusCode::OK;
        state.headers.clear();
        state.pending.clear();
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.writable()?;
        state.flush();
        Ok(())
    }

    async fn redirect(&self, location: &str) -> Result<(), SinkError> {
        HeaderValue::from_str(location)
            .map_err(|e| SinkError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let mut state = self.lock();
        state.uncommitted()?;
        state.status = StatusCode::FOUND;
        state.pending.clear();
        state.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(header::LOCATION.as_str()));
        state
            .headers
            .push((header::LOCATION.as_str().to_string(), location.to_string()));
        state.flush();
        Ok(())
    }

    async fn send_error(&self, status: StatusCode, message: &str) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.uncommitted()?;
        state.status = status;
        state.pending.clear();
        state.pending.push_str(message);
        state.sent.error_message = Some(message.to_string());
        state.flush();
        Ok(())
    }

    fn is_committed(&self) -> bool {
        self.lock().sent.committed
    }

    fn close(&self) -> Result<(), SinkError> {
        let mut state = self.lock();
        if state.sent.closed {
            return Ok(());
        }
        state.commit();
        state.sent.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_flush_commits_status_and_headers() {
        let sink = BufferedResponse::new();
        sink.set_status(StatusCode::BAD_REQUEST).unwrap();
        sink.set_header("X-Test", "1").unwrap();
        sink.append("hello").unwrap();
        sink.flush().await.unwrap();

        assert!(matches!(
            sink.set_status(StatusCode::OK),
            Err(SinkError::Committed)
        ));
        sink.append(" world").unwrap();
        sink.flush().await.unwrap();

        let sent = sink.snapshot();
        assert_eq!(sent.status, StatusCode::BAD_REQUEST);
        assert_eq!(sent.header("x-test"), Some("1"));
        assert_eq!(sent.body, "hello world");
        assert_eq!(sent.flushes, 2);
    }

    #[tokio::test]
    async fn close_sends_pending_and_rejects_later_writes() {
        let sink = BufferedResponse::new();
        sink.set_status(StatusCode::FOUND).unwrap();
        sink.set_header("Location", "http://example.com").unwrap();
        sink.close().unwrap();
        sink.close().unwrap();

        let sent = sink.snapshot();
        assert!(sent.closed && sent.committed);
        assert_eq!(sent.status, StatusCode::FOUND);
        assert_eq!(sent.flushes, 0);
        assert!(matches!(sink.append("late"), Err(SinkError::Closed)));
        assert!(matches!(sink.flush().await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn reset_discards_only_uncommitted_output() {
        let sink = BufferedResponse::new();
        sink.set_status(StatusCode::BAD_REQUEST).unwrap();
        sink.set_header("X-Test", "1").unwrap();
        sink.append("partial").unwrap();
        sink.reset().unwrap();
        sink.flush().await.unwrap();

        let sent = sink.snapshot();
        assert_eq!(sent.status, StatusCode::OK);
        assert!(sent.headers.is_empty());
        assert!(sent.body.is_empty());
        assert!(matches!(sink.reset(), Err(SinkError::Committed)));
    }

    #[tokio::test]
    async fn redirect_and_send_error_require_uncommitted_response() {
        let sink = BufferedResponse::new();
        sink.send_error(StatusCode::BAD_REQUEST, "nope").await.unwrap();
        assert!(matches!(
            sink.redirect("http://example.com").await,
            Err(SinkError::Committed)
        ));

        let sent = sink.snapshot();
        assert_eq!(sent.status, StatusCode::BAD_REQUEST);
        assert_eq!(sent.error_message.as_deref(), Some("nope"));
        assert_eq!(sent.body, "nope");
    }
}
