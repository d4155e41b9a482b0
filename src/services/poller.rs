// src/services/poller.rs

//! Proxy-rotating polling scheduler.
//!
//! Produces a stream of responses against a single (hot-swappable) URL at a
//! target aggregate rate, rotating through the location-grouped client pool
//! under per-group cooldowns and a work schedule.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{Proxy, Response, WorkSchedule};
use crate::services::client::PollClient;
use crate::services::geo::{LocationResolver, StaticResolver};
use crate::services::metrics::{
    Metrics, NoopMetrics, METRIC_NEWS_ERRORS_TOTAL, METRIC_NEWS_FETCHED_TOTAL,
    METRIC_NEWS_POLL_DURATION, METRIC_NEWS_REQUESTS_TOTAL, METRIC_NEWS_REQUEST_DURATION,
};
use crate::services::notifier::{NoopNotifier, Notifier};
use crate::services::pool::ClientQueuePool;

/// Transport failures are aggregated; one log line per this many errors.
const FAILURE_LOG_THRESHOLD: i64 = 249;

/// Builds one client per proxy.
pub type ClientFactory = dyn Fn(&Proxy) -> Result<Arc<dyn PollClient>> + Send + Sync;

pub struct RotatingPoller {
    url: RwLock<String>,
    target_rps: f64,
    single_proxy_max_rps: f64,
    pool: ClientQueuePool,
    total_clients: usize,
    work_schedule: Option<WorkSchedule>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn Metrics>,
    running: AtomicBool,
}

impl RotatingPoller {
    pub fn builder() -> RotatingPollerBuilder {
        RotatingPollerBuilder::new()
    }

    /// Hot-swap the target URL.
    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.write().expect("url lock poisoned") = url.into();
    }

    /// Snapshot of the current target URL.
    pub fn url(&self) -> String {
        self.url.read().expect("url lock poisoned").clone()
    }

    fn work_now(&self) -> bool {
        self.work_schedule.as_ref().map_or(true, |ws| ws.work_now())
    }

    fn next_work_session(&self) -> Result<chrono::Duration> {
        match &self.work_schedule {
            Some(ws) => ws.next_work_session(),
            None => Ok(chrono::Duration::zero()),
        }
    }

    /// Start the scheduling loop. Idempotent-fail: a second call returns
    /// `AlreadyPolling` without starting any work.
    ///
    /// The receiver closes once `token` is cancelled and every in-flight
    /// dispatch has finished.
    pub fn start_polling(
        self: Arc<Self>,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<Response>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::AlreadyPolling);
        }

        let (tx, rx) = mpsc::channel(self.total_clients.max(1) << 1);
        let poller = self;

        tokio::spawn(async move {
            loop {
                let round =
                    AssertUnwindSafe(Arc::clone(&poller).populate(token.clone(), tx.clone()))
                        .catch_unwind()
                        .await;
                match round {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(payload) => {
                        error!(panic = %panic_message(payload.as_ref()), "panic in polling loop");
                        continue;
                    }
                }
            }
            // tx drops here, closing the response channel.
        });

        Ok(rx)
    }

    /// One run of the scheduling loop. Returns `false` to stop for good
    /// (cancellation), `true` to be restarted by the recovery wrapper.
    async fn populate(
        self: Arc<Self>,
        token: CancellationToken,
        responses: mpsc::Sender<Response>,
    ) -> bool {
        let polling_interval = Duration::from_secs_f64(1.0 / self.target_rps);
        info!(interval = ?polling_interval, "polling news with interval");

        self.notifier.send_message(format!(
            "Service is running.\nTarget RPS: {}\nSingle proxy max RPS: {}\nProxies count: {}\nPolling interval: {:?}\nURL: {}",
            self.target_rps,
            self.single_proxy_max_rps,
            self.total_clients,
            polling_interval,
            self.url(),
        ));

        let initial_offset = match self.next_work_session() {
            Ok(offset) => offset.to_std().unwrap_or(Duration::ZERO),
            Err(e) => {
                error!(error = %e, "failed to get next work session");
                Duration::ZERO
            }
        };
        let mut last_poll_start = Instant::now() + initial_offset;
        let mut work_debt = Duration::ZERO;

        let failed_count = Arc::new(AtomicI64::new(0));
        let tracker = TaskTracker::new();

        loop {
            if !self.work_now() {
                let until_next = match self.next_work_session() {
                    Ok(duration) => duration,
                    Err(e) => {
                        error!(error = %e, "failed to get next work session");
                        return true;
                    }
                };

                self.notifier.send_message(format!(
                    "Service is not working now. Next work session in {until_next}"
                ));

                // A negative duration means today's window already passed;
                // the clamp makes it a no-op sleep.
                let sleep_for = until_next.to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }

                self.notifier
                    .send_message("Poller was resumed after sleep".to_string());
            }

            if token.is_cancelled() {
                info!("context cancelled, waiting for in-flight dispatches");
                tracker.close();
                tracker.wait().await;
                return false;
            }

            let (clients, release) = self.pool.acquire().await;

            let poller = Arc::clone(&self);
            let responses_tx = responses.clone();
            let failures = Arc::clone(&failed_count);
            tracker.spawn(async move {
                let poll_started = Instant::now();

                let fetches = clients.into_iter().map(|client| {
                    let poller = Arc::clone(&poller);
                    let tx = responses_tx.clone();
                    let failures = Arc::clone(&failures);
                    async move { poller.fetch_one(client, tx, &failures).await }
                });
                futures::future::join_all(fetches).await;

                poller
                    .metrics
                    .observe_histogram(METRIC_NEWS_POLL_DURATION, poll_started.elapsed(), &[]);
            });

            // The group goes back to the queue now, stamped with its
            // acquisition instant; its requests may still be in flight.
            drop(release);

            let elapsed = last_poll_start.elapsed();
            let budget = polling_interval.as_nanos() as i128
                - elapsed.as_nanos() as i128
                - work_debt.as_nanos() as i128;
            if budget < 0 {
                work_debt = Duration::from_nanos((-budget) as u64);
            } else {
                work_debt = Duration::ZERO;
                if budget > 0 {
                    tokio::time::sleep(Duration::from_nanos(budget as u64)).await;
                }
            }
            last_poll_start = Instant::now();
        }
    }

    async fn fetch_one(
        &self,
        client: Arc<dyn PollClient>,
        responses: mpsc::Sender<Response>,
        failures: &AtomicI64,
    ) {
        let started = Instant::now();
        self.metrics
            .increment_counter(METRIC_NEWS_REQUESTS_TOTAL, &[]);

        let url = self.url();
        let result = client.request(&url).await;

        self.metrics
            .observe_histogram(METRIC_NEWS_REQUEST_DURATION, started.elapsed(), &[]);

        let response = match result {
            Ok(response) => {
                self.metrics
                    .increment_counter(METRIC_NEWS_FETCHED_TOTAL, &[]);
                response
            }
            Err(e) => {
                self.metrics.increment_counter(METRIC_NEWS_ERRORS_TOTAL, &[]);

                let failed = failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failed > FAILURE_LOG_THRESHOLD {
                    error!(
                        error = %e,
                        suppressed_errors = failed,
                        "failed to fetch response"
                    );
                    failures.store(0, Ordering::SeqCst);
                    return;
                }

                Response::empty(client.proxy_address())
            }
        };

        // Backpressure is deliberate: a stalled consumer stalls dispatches.
        let _ = responses.send(response).await;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder validating rates, proxies, and pool capacity before any polling
/// runs.
pub struct RotatingPollerBuilder {
    url: String,
    target_rps: f64,
    single_proxy_max_rps: f64,
    proxies: Vec<Proxy>,
    client_factory: Option<Box<ClientFactory>>,
    work_schedule: Option<WorkSchedule>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn Metrics>,
    resolver: Box<dyn LocationResolver>,
}

impl Default for RotatingPollerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RotatingPollerBuilder {
    pub fn new() -> Self {
        Self {
            url: String::new(),
            target_rps: 0.0,
            single_proxy_max_rps: 0.0,
            proxies: Vec::new(),
            client_factory: None,
            work_schedule: None,
            notifier: Arc::new(NoopNotifier),
            metrics: Arc::new(NoopMetrics),
            resolver: Box::new(StaticResolver::empty()),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_target_rps(mut self, target_rps: f64) -> Self {
        self.target_rps = target_rps;
        self
    }

    pub fn with_single_proxy_max_rps(mut self, single_proxy_max_rps: f64) -> Self {
        self.single_proxy_max_rps = single_proxy_max_rps;
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<Proxy>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_client_factory(
        mut self,
        factory: impl Fn(&Proxy) -> Result<Arc<dyn PollClient>> + Send + Sync + 'static,
    ) -> Self {
        self.client_factory = Some(Box::new(factory));
        self
    }

    pub fn with_work_schedule(mut self, work_schedule: WorkSchedule) -> Self {
        self.work_schedule = Some(work_schedule);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_location_resolver(mut self, resolver: impl LocationResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub async fn build(self) -> Result<Arc<RotatingPoller>> {
        Url::parse(&self.url)?;

        if self.target_rps <= 0.0 {
            return Err(AppError::validation("target_rps must be > 0"));
        }
        if self.single_proxy_max_rps <= 0.0 {
            return Err(AppError::validation("single_proxy_max_rps must be > 0"));
        }
        if self.proxies.is_empty() {
            return Err(AppError::NoProxies);
        }
        let factory = self
            .client_factory
            .ok_or_else(|| AppError::validation("client factory is required"))?;

        let mut clients: Vec<Arc<dyn PollClient>> = Vec::with_capacity(self.proxies.len());
        for proxy in &self.proxies {
            clients.push(factory(proxy)?);
        }
        let total_clients = clients.len();

        let rest_interval = Duration::from_secs_f64(1.0 / self.single_proxy_max_rps);
        let pool = ClientQueuePool::new(clients, rest_interval, self.resolver.as_ref()).await;

        let min_expected = (self.target_rps / self.single_proxy_max_rps).ceil() as usize;
        if pool.len() < min_expected {
            return Err(AppError::InsufficientProxies {
                expected: min_expected,
                actual: pool.len(),
            });
        }

        Ok(Arc::new(RotatingPoller {
            url: RwLock::new(self.url),
            target_rps: self.target_rps,
            single_proxy_max_rps: self.single_proxy_max_rps,
            pool,
            total_clients,
            work_schedule: self.work_schedule,
            notifier: self.notifier,
            metrics: self.metrics,
            running: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;

    use crate::services::notifier::testing::TestNotifier;

    struct MockClient {
        addr: String,
        latency: Duration,
    }

    #[async_trait]
    impl PollClient for MockClient {
        async fn request(&self, _url: &str) -> Result<Response> {
            tokio::time::sleep(self.latency).await;
            Ok(Response::new(
                chrono::Utc::now(),
                200,
                HeaderMap::new(),
                Vec::new(),
                self.addr.clone(),
                "mock".to_string(),
            ))
        }

        fn proxy_address(&self) -> &str {
            &self.addr
        }

        fn ip_address(&self) -> &str {
            &self.addr
        }
    }

    fn proxies(count: usize) -> Vec<Proxy> {
        (0..count)
            .map(|i| Proxy {
                host: format!("10.0.0.{}", i + 1),
                port: 8080,
                username: "user".to_string(),
                password: "pass".to_string(),
            })
            .collect()
    }

    fn mock_factory(
        latency: Duration,
    ) -> impl Fn(&Proxy) -> Result<Arc<dyn PollClient>> + Send + Sync {
        move |proxy| {
            Ok(Arc::new(MockClient {
                addr: proxy.to_string(),
                latency,
            }) as Arc<dyn PollClient>)
        }
    }

    fn base_builder(proxy_count: usize) -> RotatingPollerBuilder {
        RotatingPoller::builder()
            .with_url("https://upbit.com/service_center/notice?id=1")
            .with_target_rps(5.0)
            .with_single_proxy_max_rps(2.0)
            .with_proxies(proxies(proxy_count))
            .with_client_factory(mock_factory(Duration::from_millis(100)))
    }

    #[tokio::test]
    async fn test_build_rejects_zero_target_rps() {
        let result = base_builder(3).with_target_rps(0.0).build().await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_empty_proxies() {
        let result = base_builder(0).build().await;
        assert!(matches!(result, Err(AppError::NoProxies)));
    }

    #[tokio::test]
    async fn test_build_rejects_missing_factory() {
        let result = RotatingPoller::builder()
            .with_url("https://upbit.com/x")
            .with_target_rps(5.0)
            .with_single_proxy_max_rps(2.0)
            .with_proxies(proxies(3))
            .build()
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_build_rejects_insufficient_pool() {
        // target 5 rps at 2 rps per proxy needs three groups; two exist.
        let result = base_builder(2).build().await;
        assert!(matches!(
            result,
            Err(AppError::InsufficientProxies {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_start_polling_is_single_start() {
        let poller = base_builder(3).build().await.unwrap();
        let token = CancellationToken::new();

        let _rx = poller.clone().start_polling(token.clone()).unwrap();
        let second = poller.clone().start_polling(token.clone());
        assert!(matches!(second, Err(AppError::AlreadyPolling)));

        token.cancel();
    }

    #[tokio::test]
    async fn test_set_url_is_visible_to_dispatches() {
        let poller = base_builder(3).build().await.unwrap();
        assert_eq!(poller.url(), "https://upbit.com/service_center/notice?id=1");
        poller.set_url("https://upbit.com/service_center/notice?id=2");
        assert_eq!(poller.url(), "https://upbit.com/service_center/notice?id=2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_run_rate_approaches_target() {
        // Three proxies in one location become three single-client groups:
        // the rotation reuses a group every 600 ms, above the 500 ms rest.
        let poller = base_builder(3).build().await.unwrap();
        let token = CancellationToken::new();
        let mut rx = poller.clone().start_polling(token.clone()).unwrap();

        let received = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        let consumer = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        token.cancel();
        consumer.await.unwrap();

        // 5 iterations/s of one request each over 60 s, within ±5%.
        let total = received.load(Ordering::SeqCst);
        assert!(
            (285..=315).contains(&total),
            "dispatched {total} requests, expected ~300"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_closes_channel_after_inflight_work() {
        let poller = base_builder(3).build().await.unwrap();
        let token = CancellationToken::new();
        let mut rx = poller.clone().start_polling(token.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();

        // Drain until the channel closes; it must close.
        while rx.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_notification_carries_configuration() {
        let notifier = Arc::new(TestNotifier::new());
        let poller = base_builder(3)
            .with_notifier(notifier.clone() as Arc<dyn Notifier>)
            .build()
            .await
            .unwrap();
        let token = CancellationToken::new();
        let _rx = poller.clone().start_polling(token.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let messages = notifier.messages();
        assert!(!messages.is_empty());
        assert!(messages[0].contains("Service is running."));
        assert!(messages[0].contains("Target RPS: 5"));
        assert!(messages[0].contains("Proxies count: 3"));
    }
}
