use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_complete::{
    errors::SinkError,
    pool::{Config as PoolConfig, WorkerPool},
    telemetry, AsyncCoordinator, BufferedResponse, CoordinatorConfig, Request, ResponseSink,
    Strategy,
};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use http::StatusCode;
use tokio::runtime::Builder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Direct,
    Pooled,
}

/// Replays request paths through the async completion flow against an
/// in-memory host and logs what each client would have received.
#[derive(Parser, Debug)]
#[command(version, about)]
struct CliArgs {
    /// Where request tasks run.
    ///
    /// Environment variable: `ASYNC_STRATEGY`
    #[arg(long, value_enum, env = "ASYNC_STRATEGY", default_value = "pooled")]
    strategy: StrategyArg,

    /// Request paths to replay, comma separated.
    ///
    /// Environment variable: `ASYNC_PATHS`
    #[arg(
        long,
        env = "ASYNC_PATHS",
        value_delimiter = ',',
        default_value = "/app/redirect1,/app/redirect2,/app/error1,/app/error2,/app/hello"
    )]
    paths: Vec<String>,

    /// Async timeout in milliseconds. 0 disables the timer.
    ///
    /// Environment variable: `ASYNC_TIMEOUT_MS`
    #[arg(long, env = "ASYNC_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Artificial delay added to every flush, to push requests past the
    /// timeout.
    ///
    /// Environment variable: `ASYNC_WRITE_DELAY_MS`
    #[arg(long, env = "ASYNC_WRITE_DELAY_MS", default_value_t = 0)]
    write_delay_ms: u64,

    /// Runtime worker threads. Defaults to the number of CPUs.
    ///
    /// Environment variable: `ASYNC_RUNTIME_THREADS`
    #[arg(long, env = "ASYNC_RUNTIME_THREADS")]
    runtime_threads: Option<usize>,
}

#[derive(Debug, Clone)]
struct DemoConfig {
    pooled: bool,
    pool: PoolConfig,
    paths: Vec<String>,
    coordinator: CoordinatorConfig,
    write_delay: Option<Duration>,
    runtime_threads: usize,
}

impl TryFrom<CliArgs> for DemoConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.paths.is_empty() {
            anyhow::bail!("ASYNC_PATHS must name at least one request path");
        }
        if let Some(bad) = args.paths.iter().find(|p| !p.starts_with('/')) {
            anyhow::bail!("request path {bad:?} must start with '/'");
        }

        let pool = PoolConfig::from_env();
        pool.validate().context("invalid worker pool configuration")?;

        let runtime_threads = args.runtime_threads.unwrap_or_else(num_cpus::get);
        if runtime_threads == 0 {
            anyhow::bail!("ASYNC_RUNTIME_THREADS must be greater than 0");
        }

        Ok(Self {
            pooled: args.strategy == StrategyArg::Pooled,
            pool,
            paths: args.paths,
            coordinator: CoordinatorConfig {
                async_timeout: (args.timeout_ms > 0)
                    .then(|| Duration::from_millis(args.timeout_ms)),
            },
            write_delay: (args.write_delay_ms > 0)
                .then(|| Duration::from_millis(args.write_delay_ms)),
            runtime_threads,
        })
    }
}

/// Host connection that is slow to push bytes out.
struct SlowConnection {
    inner: Arc<BufferedResponse>,
    delay: Duration,
}

#[async_trait]
impl ResponseSink for SlowConnection {
    fn set_status(&self, status: StatusCode) -> Result<(), SinkError> {
        self.inner.set_status(status)
    }

    fn set_header(&self, name: &str, value: &str) -> Result<(), SinkError> {
        self.inner.set_header(name, value)
    }

    fn append(&self, text: &str) -> Result<(), SinkError> {
        self.inner.append(text)
    }

    fn reset(&self) -> Result<(), SinkError> {
        self.inner.reset()
    }

    async fn flush(&self) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.flush().await
    }

    async fn redirect(&self, location: &str) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.redirect(location).await
    }

    async fn send_error(&self, status: StatusCode, message: &str) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.send_error(status, message).await
    }

    fn is_committed(&self) -> bool {
        self.inner.is_committed()
    }

    fn close(&self) -> Result<(), SinkError> {
        self.inner.close()
    }
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = DemoConfig::try_from(args)?;

    telemetry::init_tracing()?;

    let rt = Builder::new_multi_thread()
        .worker_threads(config.runtime_threads)
        .enable_all()
        .build()?;

    rt.block_on(run(config))
}

async fn run(config: DemoConfig) -> anyhow::Result<()> {
    let pool = config
        .pooled
        .then(|| WorkerPool::with_config(config.pool.clone()));
    let strategy = match &pool {
        Some(pool) => Strategy::Pooled(Arc::clone(pool)),
        None => Strategy::Direct,
    };
    tracing::info!(?strategy, requests = config.paths.len(), "replaying requests");

    let coordinator = AsyncCoordinator::new(strategy, config.coordinator.clone());

    let mut inflight = Vec::with_capacity(config.paths.len());
    for path in &config.paths {
        let buffer = Arc::new(BufferedResponse::new());
        let sink: Arc<dyn ResponseSink> = match config.write_delay {
            Some(delay) => Arc::new(SlowConnection {
                inner: Arc::clone(&buffer),
                delay,
            }),
            None => buffer.clone(),
        };

        match coordinator.service(Request::get(path.as_str()), sink) {
            Ok(handle) => inflight.push((handle, buffer)),
            Err(e) => tracing::error!(error = %e, %path, "request was not dispatched"),
        }
    }

    for (handle, buffer) in inflight {
        handle.closed().await;
        let sent = buffer.snapshot();
        tracing::info!(
            path = %handle.request().path(),
            status = %sent.status,
            location = sent.header("Location").unwrap_or("-"),
            body = %sent.body.trim_end(),
            "response sent"
        );
    }

    if let Some(pool) = pool {
        let metrics = pool.metrics();
        tracing::info!(
            finished = metrics.finished(),
            completed = metrics.completed_tasks,
            cancelled = metrics.cancelled_tasks,
            failed = metrics.failed_tasks,
            "worker pool drained"
        );
        if !pool.shutdown_timeout(Duration::from_secs(5)).await {
            tracing::warn!("worker pool did not stop in time");
        }
    }

    Ok(())
}
