// src/fetchers/announcement_by_id.rs

//! Announcement-by-ID fetcher: probes the JSON announcement endpoint at the
//! next unseen ID. `success == false` with `error_code == -1` means the ID
//! does not exist yet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{AppError, Result};
use crate::models::{Announcements, Config, NewsTitle, Response, SingleAnnouncement, UpbitApiConfig};
use crate::services::client::{client_factory, HttpPollClient, PollClient};
use crate::services::geo::LocationResolver;
use crate::services::metrics::{
    Metrics, METRIC_NEWS_PARSE_DURATION, METRIC_NEW_NEWS_DETECTED_TOTAL,
};
use crate::services::notifier::Notifier;
use crate::services::poller::RotatingPoller;

use super::FETCHER_CHANNEL_SIZE;

const FETCHER_LABEL: &str = "announcement_by_id";

struct FetcherState {
    last_title: NewsTitle,
    next_id: i64,
}

pub struct AnnouncementByIdFetcher {
    poller: Arc<RotatingPoller>,
    state: Mutex<FetcherState>,
    streaming: AtomicBool,
    api: UpbitApiConfig,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn Metrics>,
}

impl AnnouncementByIdFetcher {
    pub async fn new(
        config: &Config,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn Metrics>,
        resolver: impl LocationResolver + 'static,
    ) -> Result<Arc<Self>> {
        let bootstrap_client = HttpPollClient::new(
            None,
            config.proxy_rotating_poller.retries.clone(),
            Arc::clone(&metrics),
        )?;

        let (last_title, next_id) =
            Self::bootstrap(&config.upbit_api, &bootstrap_client).await?;

        let poller = RotatingPoller::builder()
            .with_url(config.upbit_api.announcement_by_id_url(next_id))
            .with_target_rps(config.proxy_rotating_poller.target_rps)
            .with_single_proxy_max_rps(config.upbit_api.announcement_by_id_single_ip_max_rps)
            .with_proxies(config.proxy_rotating_poller.proxies.clone())
            .with_work_schedule(config.proxy_rotating_poller.work_schedule.clone())
            .with_notifier(Arc::clone(&notifier))
            .with_metrics(Arc::clone(&metrics))
            .with_location_resolver(resolver)
            .with_client_factory(client_factory(
                config.proxy_rotating_poller.client,
                config.proxy_rotating_poller.retries.clone(),
                Arc::clone(&metrics),
            ))
            .build()
            .await?;

        Ok(Arc::new(Self::from_parts(
            config.upbit_api.clone(),
            poller,
            last_title,
            next_id,
            notifier,
            metrics,
        )))
    }

    pub(crate) fn from_parts(
        api: UpbitApiConfig,
        poller: Arc<RotatingPoller>,
        last_title: NewsTitle,
        next_id: i64,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            poller,
            state: Mutex::new(FetcherState {
                last_title,
                next_id,
            }),
            streaming: AtomicBool::new(false),
            api,
            notifier,
            metrics,
        }
    }

    async fn bootstrap(
        api: &UpbitApiConfig,
        client: &dyn PollClient,
    ) -> Result<(NewsTitle, i64)> {
        let response = client.request(&api.announcements_url(1)).await?;

        let list: Announcements = serde_json::from_slice(&response.body)?;
        if !list.success {
            return Err(AppError::parse("announcements list", list.error_message));
        }

        let mut notices = list.data.notices;
        if notices.is_empty() {
            return Err(AppError::parse("announcements list", "no announcements found"));
        }
        notices.sort_by_key(|notice| notice.id);

        let latest = notices.last().expect("notices checked non-empty");
        let mut last_title = latest.title.clone();
        let mut next_id = latest.id + 1;

        let probe_interval =
            Duration::from_secs_f64(1.0 / api.announcement_by_id_single_ip_max_rps);

        loop {
            tokio::time::sleep(probe_interval).await;

            let response = client.request(&api.announcement_by_id_url(next_id)).await?;
            let announcement: SingleAnnouncement = serde_json::from_slice(&response.body)?;

            if !announcement.success {
                if announcement.is_empty_sentinel() {
                    info!(next_id, last_title = %last_title, "no more announcements");
                    return Ok((last_title, next_id));
                }

                error!(error = %announcement.error_message, "failed to get announcement");
                return Err(AppError::parse("announcement", announcement.error_message));
            }

            next_id = announcement.data.id + 1;
            last_title = announcement.data.title;
        }
    }

    /// Start streaming newly observed announcement titles.
    pub async fn stream_new_titles(
        self: Arc<Self>,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<NewsTitle>> {
        if self
            .streaming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::AlreadyStreaming);
        }

        // Re-arm in case the ID advanced between construction and start.
        let next_id = self.state.lock().await.next_id;
        self.poller.set_url(self.api.announcement_by_id_url(next_id));

        let mut responses = Arc::clone(&self.poller).start_polling(token.clone())?;
        let (tx, rx) = mpsc::channel(FETCHER_CHANNEL_SIZE);

        let fetcher = self;
        tokio::spawn(async move {
            loop {
                let response = tokio::select! {
                    _ = token.cancelled() => break,
                    response = responses.recv() => match response {
                        Some(response) => response,
                        None => break,
                    },
                };

                if fetcher.handle_response(response, &tx).await.is_break() {
                    break;
                }
            }
            // tx drops here, closing the title channel.
        });

        Ok(rx)
    }

    async fn handle_response(
        &self,
        response: Response,
        titles: &mpsc::Sender<NewsTitle>,
    ) -> std::ops::ControlFlow<()> {
        use std::ops::ControlFlow;

        if !response.is_ok() {
            if response.is_too_many_requests() {
                self.notifier
                    .send_message("Something is wrong with poller: too many requests".to_string());
                error!(status = response.status_code, "too many requests");
                return ControlFlow::Break(());
            }

            return ControlFlow::Continue(());
        }

        let started = std::time::Instant::now();
        let parsed: std::result::Result<SingleAnnouncement, _> =
            serde_json::from_slice(&response.body);
        self.metrics.observe_histogram(
            METRIC_NEWS_PARSE_DURATION,
            started.elapsed(),
            &[("fetcher", FETCHER_LABEL.to_string())],
        );

        let announcement = match parsed {
            Ok(announcement) => announcement,
            Err(e) => {
                error!(
                    error = %e,
                    body = %String::from_utf8_lossy(&response.body),
                    "failed to parse announcement"
                );
                return ControlFlow::Continue(());
            }
        };

        if announcement.success {
            self.update_and_notify(titles, announcement, &response).await;
        }

        ControlFlow::Continue(())
    }

    async fn update_and_notify(
        &self,
        titles: &mpsc::Sender<NewsTitle>,
        announcement: SingleAnnouncement,
        response: &Response,
    ) {
        let notice = announcement.data;

        let mut state = self.state.lock().await;

        if state.last_title == notice.title {
            info!(id = notice.id, title = %notice.title, "skipping announcement");
            return;
        }

        state.next_id = notice.id + 1;
        state.last_title = notice.title.clone();

        self.poller
            .set_url(self.api.announcement_by_id_url(state.next_id));

        let _ = titles.send(notice.title.clone()).await;

        self.metrics.increment_counter(
            METRIC_NEW_NEWS_DETECTED_TOTAL,
            &[("fetcher", FETCHER_LABEL.to_string())],
        );

        let listed_at = notice
            .listed_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_default();
        let first_listed_at = notice
            .first_listed_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_default();
        let received_to_listed = notice
            .listed_at
            .map(|at| (response.received_at - at).to_string())
            .unwrap_or_default();

        self.notifier.send_message(format!(
            "!!!New announcement !!!\n* NEWS INFO\nTitle: {}\nCategory: {}\n\nListed at: {}\nFirst listed at: {}\n\n* RESPONSE INFO\nClient: {}\nProxy address: {}\n\nRequested at: {}\nReceived at: {}\n\nStatus: {}\nHeaders: {:?}\n\n* DELAYS INFO\nBetween requested_at and received_at: {}\nBetween received_at and listed_at: {}\n",
            notice.title,
            notice.category,
            listed_at,
            first_listed_at,
            response.client_name,
            response.proxy_addr,
            response.requested_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            response.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            response.status_code,
            response.headers,
            response.received_at - response.requested_at,
            received_to_listed,
        ));
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> (NewsTitle, i64) {
        let state = self.state.lock().await;
        (state.last_title.clone(), state.next_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use std::ops::ControlFlow;

    use crate::models::Proxy;
    use crate::services::metrics::testing::TestMetrics;
    use crate::services::metrics::NoopMetrics;
    use crate::services::notifier::testing::TestNotifier;
    use crate::services::notifier::NoopNotifier;

    fn announcement_body(id: i64, title: &str) -> Vec<u8> {
        format!(
            r#"{{"success": true, "data": {{"id": {id}, "category": "Trade", "title": "{title}"}}}}"#
        )
        .into_bytes()
    }

    fn response_with(status: u16, body: Vec<u8>) -> Response {
        Response::new(
            chrono::Utc::now(),
            status,
            HeaderMap::new(),
            body,
            "direct".to_string(),
            "mock".to_string(),
        )
    }

    fn api_config() -> UpbitApiConfig {
        UpbitApiConfig {
            announcements_endpoint: "https://api.example.com/announcements?page=%d".to_string(),
            announcements_single_ip_max_rps: 0.2,
            announcement_by_id_endpoint: "https://api.example.com/announcements/%d".to_string(),
            announcement_by_id_single_ip_max_rps: 0.2,
            notice_by_id_endpoint: "https://example.com/notice?id=%d".to_string(),
            notice_by_id_single_ip_max_rps: 0.5,
        }
    }

    async fn test_poller(url: &str) -> Arc<RotatingPoller> {
        struct NeverClient;

        #[async_trait::async_trait]
        impl PollClient for NeverClient {
            async fn request(&self, _url: &str) -> Result<Response> {
                unreachable!("fetcher unit tests never dispatch")
            }
            fn proxy_address(&self) -> &str {
                "direct"
            }
            fn ip_address(&self) -> &str {
                "127.0.0.1"
            }
        }

        RotatingPoller::builder()
            .with_url(url)
            .with_target_rps(1.0)
            .with_single_proxy_max_rps(1.0)
            .with_proxies(vec![Proxy {
                host: "10.0.0.1".to_string(),
                port: 8080,
                username: "u".to_string(),
                password: "p".to_string(),
            }])
            .with_client_factory(|_| Ok(Arc::new(NeverClient) as Arc<dyn PollClient>))
            .build()
            .await
            .unwrap()
    }

    async fn fetcher_with(
        metrics: Arc<dyn Metrics>,
        notifier: Arc<dyn Notifier>,
    ) -> AnnouncementByIdFetcher {
        let api = api_config();
        let poller = test_poller(&api.announcement_by_id_url(100)).await;
        AnnouncementByIdFetcher::from_parts(api, poller, "A".to_string(), 100, notifier, metrics)
    }

    #[tokio::test]
    async fn test_unchanged_title_is_not_emitted() {
        let metrics = Arc::new(TestMetrics::new());
        let fetcher = fetcher_with(metrics.clone(), Arc::new(NoopNotifier)).await;
        let (tx, mut rx) = mpsc::channel(8);

        let flow = fetcher
            .handle_response(response_with(200, announcement_body(99, "A")), &tx)
            .await;

        assert!(matches!(flow, ControlFlow::Continue(())));
        assert!(rx.try_recv().is_err());
        assert_eq!(fetcher.snapshot().await, ("A".to_string(), 100));
        assert_eq!(metrics.counter_total(METRIC_NEW_NEWS_DETECTED_TOTAL), 0);
    }

    #[tokio::test]
    async fn test_new_title_advances_to_id_plus_one() {
        let metrics = Arc::new(TestMetrics::new());
        let fetcher = fetcher_with(metrics.clone(), Arc::new(NoopNotifier)).await;
        let (tx, mut rx) = mpsc::channel(8);

        fetcher
            .handle_response(response_with(200, announcement_body(100, "B")), &tx)
            .await;

        assert_eq!(rx.try_recv().unwrap(), "B");
        assert_eq!(fetcher.snapshot().await, ("B".to_string(), 101));
        assert_eq!(
            metrics.counter(
                METRIC_NEW_NEWS_DETECTED_TOTAL,
                &[("fetcher", FETCHER_LABEL.to_string())]
            ),
            1
        );
        assert_eq!(
            fetcher.poller.url(),
            "https://api.example.com/announcements/101"
        );
    }

    #[tokio::test]
    async fn test_empty_sentinel_is_skipped() {
        let fetcher = fetcher_with(Arc::new(NoopMetrics), Arc::new(NoopNotifier)).await;
        let (tx, mut rx) = mpsc::channel(8);

        let body = br#"{"success": false, "error_code": -1, "error_message": "not found"}"#;
        let flow = fetcher
            .handle_response(response_with(200, body.to_vec()), &tx)
            .await;

        assert!(matches!(flow, ControlFlow::Continue(())));
        assert!(rx.try_recv().is_err());
        assert_eq!(fetcher.snapshot().await, ("A".to_string(), 100));
    }

    #[tokio::test]
    async fn test_rate_limit_is_fatal_for_this_consumer() {
        let notifier = Arc::new(TestNotifier::new());
        let fetcher = fetcher_with(Arc::new(NoopMetrics), notifier.clone()).await;
        let (tx, _rx) = mpsc::channel(8);

        let flow = fetcher
            .handle_response(response_with(429, Vec::new()), &tx)
            .await;

        assert!(matches!(flow, ControlFlow::Break(())));
        assert_eq!(notifier.count(), 1);
        assert!(notifier.messages()[0].contains("too many requests"));
    }

    #[tokio::test]
    async fn test_parse_failure_is_swallowed() {
        let fetcher = fetcher_with(Arc::new(NoopMetrics), Arc::new(NoopNotifier)).await;
        let (tx, mut rx) = mpsc::channel(8);

        let flow = fetcher
            .handle_response(response_with(200, b"not json".to_vec()), &tx)
            .await;

        assert!(matches!(flow, ControlFlow::Continue(())));
        assert!(rx.try_recv().is_err());
    }
}
