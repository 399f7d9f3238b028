#![allow(dead_code)]

use async_complete::{errors::SinkError, BufferedResponse, ResponseSink, ResponseSnapshot};
use async_trait::async_trait;
use http::StatusCode;
use std::{
    future::Future,
    io,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    AppendFails,
    AppendPanics,
}

/// Host connection for tests: buffers like [`BufferedResponse`], can be made
/// slow or faulty, and counts how often it was closed.
pub struct TestSink {
    inner: BufferedResponse,
    delay: Duration,
    fault: Fault,
    closes: AtomicUsize,
}

impl TestSink {
    pub fn new() -> Self {
        Self::with(Duration::ZERO, Fault::None)
    }

    pub fn slow(delay: Duration) -> Self {
        Self::with(delay, Fault::None)
    }

    pub fn faulty(fault: Fault) -> Self {
        Self::with(Duration::ZERO, fault)
    }

    fn with(delay: Duration, fault: Fault) -> Self {
        Self {
            inner: BufferedResponse::new(),
            delay,
            fault,
            closes: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> ResponseSnapshot {
        self.inner.snapshot()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl ResponseSink for TestSink {
    fn set_status(&self, status: StatusCode) -> Result<(), SinkError> {
        self.inner.set_status(status)
    }

    fn set_header(&self, name: &str, value: &str) -> Result<(), SinkError> {
        self.inner.set_header(name, value)
    }

    fn append(&self, text: &str) -> Result<(), SinkError> {
        match self.fault {
            Fault::None => self.inner.append(text),
            Fault::AppendFails => Err(SinkError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection reset",
            ))),
            Fault::AppendPanics => panic!("writer blew up"),
        }
    }

    fn reset(&self) -> Result<(), SinkError> {
        self.inner.reset()
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.pause().await;
        self.inner.flush().await
    }

    async fn redirect(&self, location: &str) -> Result<(), SinkError> {
        self.pause().await;
        self.inner.redirect(location).await
    }

    async fn send_error(&self, status: StatusCode, message: &str) -> Result<(), SinkError> {
        self.pause().await;
        self.inner.send_error(status, message).await
    }

    fn is_committed(&self) -> bool {
        self.inner.is_committed()
    }

    fn close(&self) -> Result<(), SinkError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub async fn within<F: Future>(timeout: Duration, fut: F) -> F::Output {
    match tokio::time::timeout(timeout, fut).await {
        Ok(out) => out,
        Err(_) => panic!("did not finish within {timeout:?}"),
    }
}
