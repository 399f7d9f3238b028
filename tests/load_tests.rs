mod common;

#[cfg(test)]
mod tests {
    use super::common::{wait_until, within, TestSink};
    use async_complete::{
        pool::{Config, WorkerPool},
        AsyncCoordinator, CoordinatorConfig, Request, Strategy,
    };
    use http::StatusCode;
    use std::{
        future::Future,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    async fn measure<F, Fut, T>(name: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let start = Instant::now();
        let result = f().await;
        let elapsed = start.elapsed();
        println!("✓ {}: {:?}", name, elapsed);
        result
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn load_test_1_requests_beyond_max_workers() {
        println!("\n=== LOAD TEST 1: 60 slow requests on a 2..4 worker pool ===");
        let pool = WorkerPool::with_config(Config {
            core_workers: 2,
            max_workers: 4,
            keep_alive: Duration::from_millis(200),
            ..Default::default()
        });
        let coordinator = AsyncCoordinator::new(
            Strategy::Pooled(Arc::clone(&pool)),
            CoordinatorConfig {
                async_timeout: None,
            },
        );

        let peak_workers = Arc::new(AtomicUsize::new(0));
        let peak_active = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let monitor = {
            let pool = Arc::clone(&pool);
            let (peak_workers, peak_active, done) =
                (peak_workers.clone(), peak_active.clone(), done.clone());
            tokio::spawn(async move {
                while !done.load(Ordering::Acquire) {
                    let metrics = pool.metrics();
                    peak_workers.fetch_max(metrics.live_workers, Ordering::Relaxed);
                    peak_active.fetch_max(metrics.active_tasks, Ordering::Relaxed);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let sinks = measure("60 requests @ 10ms", || async {
            let mut inflight = Vec::new();
            for i in 0..60 {
                let sink = Arc::new(TestSink::slow(Duration::from_millis(10)));
                let handle = coordinator
                    .service(Request::get(format!("/app/item/{i}")), sink.clone())
                    .unwrap();
                inflight.push((handle, sink));
            }
            for (handle, _) in &inflight {
                within(Duration::from_secs(10), handle.closed()).await;
            }
            inflight
        })
        .await;

        done.store(true, Ordering::Release);
        monitor.await.unwrap();

        for (i, (_, sink)) in sinks.iter().enumerate() {
            let sent = sink.snapshot();
            assert_eq!(sent.status, StatusCode::OK);
            assert_eq!(sent.body, format!("You requested: /app/item/{i}\n"));
            assert_eq!(sink.closes(), 1);
        }

        let metrics = pool.metrics();
        println!("  peak workers: {}", peak_workers.load(Ordering::Relaxed));
        println!("  peak active: {}", peak_active.load(Ordering::Relaxed));
        assert!(peak_workers.load(Ordering::Relaxed) <= 4);
        assert!(peak_active.load(Ordering::Relaxed) <= 4);
        assert_eq!(metrics.total_submitted, 60);

        assert!(
            wait_until(Duration::from_secs(3), || pool.metrics().live_workers == 2).await,
            "pool shrinks back to core size"
        );
        assert!(pool.shutdown_timeout(Duration::from_secs(1)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn load_test_2_direct_strategy_burst() {
        println!("\n=== LOAD TEST 2: 500 direct requests ===");
        let coordinator = AsyncCoordinator::new(Strategy::Direct, CoordinatorConfig::default());

        let sinks = measure("500 direct requests", || async {
            let mut inflight = Vec::new();
            for i in 0..500 {
                let sink = Arc::new(TestSink::new());
                let path = if i % 5 == 0 { "/app/error2".to_string() } else { format!("/app/{i}") };
                let handle = coordinator.service(Request::get(path), sink.clone()).unwrap();
                inflight.push((handle, sink));
            }
            for (handle, _) in &inflight {
                within(Duration::from_secs(10), handle.closed()).await;
            }
            inflight
        })
        .await;

        let bad = sinks
            .iter()
            .filter(|(_, sink)| sink.snapshot().status == StatusCode::BAD_REQUEST)
            .count();
        assert_eq!(bad, 100);
        assert!(sinks.iter().all(|(_, sink)| sink.closes() == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn load_test_3_shutdown_under_load() {
        println!("\n=== LOAD TEST 3: shutdown with a full queue ===");
        let pool = WorkerPool::new(2, 2);
        let coordinator = AsyncCoordinator::new(
            Strategy::Pooled(Arc::clone(&pool)),
            CoordinatorConfig::default(),
        );

        let mut inflight = Vec::new();
        for i in 0..20 {
            let sink = Arc::new(TestSink::slow(Duration::from_millis(200)));
            let handle = coordinator
                .service(Request::get(format!("/app/{i}")), sink.clone())
                .unwrap();
            inflight.push((handle, sink));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let dropped = pool.shutdown();
        println!("  dropped from queue: {}", dropped);
        assert!(dropped >= 16);

        for (handle, sink) in &inflight {
            within(Duration::from_secs(5), handle.closed()).await;
            assert!(sink.snapshot().closed);
            assert_eq!(sink.closes(), 1);
        }
        let mut aborted = 0;
        for (i, (_, sink)) in inflight.iter().enumerate() {
            let sent = sink.snapshot();
            if sent.status == StatusCode::INTERNAL_SERVER_ERROR {
                assert!(sent.body.is_empty(), "request {i}: partial output behind a 500");
                aborted += 1;
            } else {
                assert_eq!(sent.status, StatusCode::OK, "request {i}");
                assert_eq!(sent.body, format!("You requested: /app/{i}\n"));
            }
        }
        // Nothing finishes a 200ms flush within 20ms: queued and running
        // requests alike are cut short.
        assert!(aborted >= dropped);
        assert_eq!(aborted, inflight.len(), "every request cut short is closed with a 500");

        assert!(pool.shutdown_timeout(Duration::from_secs(1)).await);
    }
}
