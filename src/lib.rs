//! Async request completion for a servlet-style host.
//!
//! A request is put into async mode, its processing is handed to a
//! background task (a fresh tokio task or a bounded [`pool::WorkerPool`]),
//! and the response is closed exactly once by whichever finishes first: the
//! task, the deadline timer, or a host error.
//!
//! # Components
//! - [`coordinator::AsyncCoordinator`]: begins the lifecycle and dispatches
//! - [`lifecycle::AsyncHandle`]: per-request state machine and listeners
//! - [`task::RequestTask`]: writes the outcome for the request path
//! - [`tracker::CompletionTracker`]: timeout and error reconciliation
//! - [`pool::WorkerPool`]: core/max workers with idle retirement

pub mod coordinator;
pub mod errors;
pub mod handle;
pub mod lifecycle;
pub mod model;
pub mod pool;
pub mod response;
pub mod result;
pub mod task;
pub mod telemetry;
pub mod tracker;

pub use coordinator::{AsyncCoordinator, CoordinatorConfig, Strategy};
pub use lifecycle::{AsyncEvent, AsyncHandle, AsyncListener, Request};
pub use pool::{Config, ThreadPool, WorkerPool};
pub use response::{BufferedResponse, ResponseSink, ResponseSnapshot};
