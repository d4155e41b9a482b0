// src/fetchers/announcements.rs

//! Announcements-list fetcher: polls the first page of the announcements
//! list and emits when the newest notice changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{AppError, Result};
use crate::models::{Announcements, Config, NewsTitle, Notice, Response, UpbitApiConfig};
use crate::services::client::{client_factory, HttpPollClient, PollClient};
use crate::services::geo::LocationResolver;
use crate::services::metrics::{
    Metrics, METRIC_NEWS_PARSE_DURATION, METRIC_NEW_NEWS_DETECTED_TOTAL,
};
use crate::services::notifier::Notifier;
use crate::services::poller::RotatingPoller;

use super::FETCHER_CHANNEL_SIZE;

const FETCHER_LABEL: &str = "announcements";

pub struct AnnouncementsFetcher {
    poller: Arc<RotatingPoller>,
    last_notice: Mutex<Notice>,
    streaming: AtomicBool,
    api: UpbitApiConfig,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn Metrics>,
}

impl AnnouncementsFetcher {
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

        let response = bootstrap_client
            .request(&config.upbit_api.announcements_url(1))
            .await?;
        let latest = parse_latest_notice(metrics.as_ref(), &response)?;
        info!(id = latest.id, title = %latest.title, "fetched initial announcements");

        let poller = RotatingPoller::builder()
            .with_url(config.upbit_api.announcements_url(1))
            .with_target_rps(config.proxy_rotating_poller.target_rps)
            .with_single_proxy_max_rps(config.upbit_api.announcements_single_ip_max_rps)
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
            latest,
            notifier,
            metrics,
        )))
    }

    pub(crate) fn from_parts(
        api: UpbitApiConfig,
        poller: Arc<RotatingPoller>,
        last_notice: Notice,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            poller,
            last_notice: Mutex::new(last_notice),
            streaming: AtomicBool::new(false),
            api,
            notifier,
            metrics,
        }
    }

    /// Start streaming newly observed announcement titles.
    pub fn stream_new_titles(
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

        info!("starting to stream new announcements");

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
            // No per-proxy ban book here: any rate limit means the poller
            // configuration is wrong for this endpoint. Stop the consumer.
            if response.is_too_many_requests() {
                self.notifier
                    .send_message("Something is wrong with poller: too many requests".to_string());
                error!(status = response.status_code, "too many requests");
                return ControlFlow::Break(());
            }

            return ControlFlow::Continue(());
        }

        let latest = match parse_latest_notice(self.metrics.as_ref(), &response) {
            Ok(latest) => latest,
            Err(e) => {
                error!(error = %e, "failed to parse announcement");
                return ControlFlow::Continue(());
            }
        };

        self.update_and_notify(titles, latest, &response).await;

        ControlFlow::Continue(())
    }

    async fn update_and_notify(
        &self,
        titles: &mpsc::Sender<NewsTitle>,
        notice: Notice,
        response: &Response,
    ) {
        let mut last_notice = self.last_notice.lock().await;

        if last_notice.title == notice.title {
            return;
        }

        *last_notice = notice.clone();

        let _ = titles.send(notice.title.clone()).await;

        self.metrics.increment_counter(
            METRIC_NEW_NEWS_DETECTED_TOTAL,
            &[("fetcher", FETCHER_LABEL.to_string())],
        );

        info!(id = notice.id, title = %notice.title, "new announcement");

        let listed_at = notice
            .listed_at
            .map(|at| at.to_string())
            .unwrap_or_default();
        let first_listed_at = notice
            .first_listed_at
            .map(|at| at.to_string())
            .unwrap_or_default();
        let received_to_listed = notice
            .listed_at
            .map(|at| (response.received_at - at).to_string())
            .unwrap_or_default();

        self.notifier.send_message(format!(
            "New announcement\n\n* NEWS INFO\nID: {}\nTitle: {}\nCategory: {}\n\nListed at: {}\nFirst listed at: {}\n\nLink: {}\n\n\n* RESPONSE INFO\nClient: {}\nProxy address: {}\n\nRequested at: {}\nReceived at: {}\n\nStatus: {}\nHeaders: {:?}\n\n\n* DELAYS INFO\nBetween received_at and listed_at: {}\n\nBetween requested_at and received_at: {}\n",
            notice.id,
            notice.title,
            notice.category,
            listed_at,
            first_listed_at,
            self.api.notice_by_id_url(notice.id),
            response.client_name,
            response.proxy_addr,
            response.requested_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            response.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            response.status_code,
            response.headers,
            received_to_listed,
            response.received_at - response.requested_at,
        ));
    }

    #[cfg(test)]
    pub(crate) async fn last_notice(&self) -> Notice {
        self.last_notice.lock().await.clone()
    }
}

/// Parse the announcements list and return the notice with the highest ID.
fn parse_latest_notice(metrics: &dyn Metrics, response: &Response) -> Result<Notice> {
    let started = std::time::Instant::now();

    let result = (|| {
        let list: Announcements = serde_json::from_slice(&response.body)?;
        if !list.success {
            return Err(AppError::parse("announcements list", list.error_message));
        }

        list.data
            .notices
            .into_iter()
            .max_by_key(|notice| notice.id)
            .ok_or_else(|| AppError::parse("announcements list", "no notices found"))
    })();

    metrics.observe_histogram(
        METRIC_NEWS_PARSE_DURATION,
        started.elapsed(),
        &[("fetcher", FETCHER_LABEL.to_string())],
    );

    result
}
