// src/fetchers/notice_by_id.rs

//! Notice-by-ID fetcher: probes the HTML notice page of the next unseen ID
//! and extracts the `<meta name="description">` content as the title.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scraper::{Html, Selector};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{AppError, Result};
use crate::models::{Announcements, Config, NewsTitle, Response, UpbitApiConfig};
use crate::services::client::{client_factory, HttpPollClient, PollClient};
use crate::services::geo::LocationResolver;
use crate::services::metrics::{
    Metrics, METRIC_NEWS_PARSE_DURATION, METRIC_NEW_NEWS_DETECTED_TOTAL,
};
use crate::services::notifier::Notifier;
use crate::services::poller::RotatingPoller;

use super::FETCHER_CHANNEL_SIZE;

/// The landing-page description the notice endpoint serves when no notice
/// exists at the requested ID.
pub const DEFAULT_NOTICE_TITLE: &str = "비트코인, 이더리움, 엑스알피(리플), NFT 등 다양한 디지털 자산, 국내 거래량 1위 거래소 업비트에서 지금 확인해보세요. No.1 Digital Asset Exchange in Korea, Upbit. Trade various digital assets conveniently and securely including Bitcoin, Ethereum, XRP(Ripple), NFT etc.";

/// How long a rate-limited proxy stays out of consideration.
const BAN_DURATION: Duration = Duration::from_secs(60 * 60);

const FETCHER_LABEL: &str = "notice_by_id";

struct FetcherState {
    last_title: NewsTitle,
    next_id: i64,
}

/// One-hour ban book for rate-limited proxies, owned by the consumer task.
#[derive(Default)]
pub(crate) struct BanBook {
    banned: HashMap<String, Instant>,
}

pub(crate) enum BanOutcome {
    /// First 429 from this proxy (or first after its ban expired): notify.
    NewBan { banned_count: usize },
    /// Still inside the ban window: drop silently.
    AlreadyBanned,
}

impl BanBook {
    pub(crate) fn note_rate_limited(&mut self, proxy: &str) -> BanOutcome {
        match self.banned.get(proxy) {
            Some(banned_at) if banned_at.elapsed() < BAN_DURATION => BanOutcome::AlreadyBanned,
            Some(_) => {
                // The hour passed; this 429 opens a fresh ban.
                self.banned.remove(proxy);
                self.banned.insert(proxy.to_string(), Instant::now());
                BanOutcome::NewBan {
                    banned_count: self.banned.len(),
                }
            }
            None => {
                self.banned.insert(proxy.to_string(), Instant::now());
                BanOutcome::NewBan {
                    banned_count: self.banned.len(),
                }
            }
        }
    }
}

pub struct NoticeByIdFetcher {
    poller: Arc<RotatingPoller>,
    state: Mutex<FetcherState>,
    streaming: AtomicBool,
    api: UpbitApiConfig,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn Metrics>,
}

impl NoticeByIdFetcher {
    /// Bootstrap against the live API with a non-proxied client, then build
    /// the rotating poller aimed at the first nonexistent notice ID.
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

        let (last_title, next_id) = Self::bootstrap(
            &config.upbit_api,
            &bootstrap_client,
            metrics.as_ref(),
        )
        .await?;

        let poller = RotatingPoller::builder()
            .with_url(config.upbit_api.notice_by_id_url(next_id))
            .with_target_rps(config.proxy_rotating_poller.target_rps)
            .with_single_proxy_max_rps(config.upbit_api.notice_by_id_single_ip_max_rps)
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

    /// Snapshot the latest known notice from the announcements list, then
    /// probe forward until the first ID that does not exist yet.
    async fn bootstrap(
        api: &UpbitApiConfig,
        client: &dyn PollClient,
        metrics: &dyn Metrics,
    ) -> Result<(NewsTitle, i64)> {
        let response = client.request(&api.announcements_url(1)).await?;

        let list: Announcements = serde_json::from_slice(&response.body)?;
        if !list.success {
            return Err(AppError::parse("announcements list", list.error_message));
        }

        let mut notices = list.data.notices;
        if notices.is_empty() {
            return Err(AppError::parse("announcements list", "no notices found"));
        }
        notices.sort_by_key(|notice| notice.id);

        let latest = notices.last().expect("notices checked non-empty");
        let mut last_title = latest.title.clone();
        let mut next_id = latest.id + 1;

        let probe_interval = Duration::from_secs_f64(1.0 / api.notice_by_id_single_ip_max_rps);
        info!(interval = ?probe_interval, "probing for the first unused notice id");

        loop {
            tokio::time::sleep(probe_interval).await;

            let response = client.request(&api.notice_by_id_url(next_id)).await?;
            let title = parse_notice_page(metrics, &response)?;

            info!(id = next_id, title = %title, "probed notice");

            if title == DEFAULT_NOTICE_TITLE {
                info!(next_id, last_title = %last_title, "no more notices");
                return Ok((last_title, next_id));
            }

            next_id += 1;
            last_title = title;
        }
    }

    /// Start streaming newly observed notice titles. Idempotent-fail:
    /// a second call returns `AlreadyStreaming`.
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

        let mut responses = Arc::clone(&self.poller).start_polling(token.clone())?;
        let (tx, rx) = mpsc::channel(FETCHER_CHANNEL_SIZE);

        let fetcher = self;
        tokio::spawn(async move {
            let mut banned = BanBook::default();

            loop {
                let response = tokio::select! {
                    _ = token.cancelled() => break,
                    response = responses.recv() => match response {
                        Some(response) => response,
                        None => break,
                    },
                };

                fetcher.handle_response(response, &tx, &mut banned).await;
            }
            // tx drops here, closing the title channel.
        });

        Ok(rx)
    }

    async fn handle_response(
        &self,
        response: Response,
        titles: &mpsc::Sender<NewsTitle>,
        banned: &mut BanBook,
    ) {
        if response.is_too_many_requests() {
            match banned.note_rate_limited(&response.proxy_addr) {
                BanOutcome::AlreadyBanned => {}
                BanOutcome::NewBan { banned_count } => {
                    self.notifier.send_message(format!(
                        "Something is wrong with poller: too many requests\nProxy: {}\nStatus: {}\nHeaders: {:?}\nDead proxies count: {}",
                        response.proxy_addr, response.status_code, response.headers, banned_count,
                    ));
                    error!(
                        status = response.status_code,
                        proxy = %response.proxy_addr,
                        headers = ?response.headers,
                        "too many requests"
                    );
                }
            }
            return;
        }

        if !response.is_ok() {
            return;
        }

        let title = match parse_notice_page(self.metrics.as_ref(), &response) {
            Ok(title) => title,
            Err(e) => {
                error!(
                    error = %e,
                    body = %String::from_utf8_lossy(&response.body),
                    "failed to parse notice page"
                );
                return;
            }
        };

        self.update_and_notify(titles, title, &response).await;
    }

    async fn update_and_notify(
        &self,
        titles: &mpsc::Sender<NewsTitle>,
        title: NewsTitle,
        response: &Response,
    ) {
        if title == DEFAULT_NOTICE_TITLE {
            return;
        }

        let mut state = self.state.lock().await;

        if state.last_title == title {
            info!(title = %title, "skipping notice");
            return;
        }

        state.next_id += 1;
        state.last_title = title.clone();

        self.poller.set_url(self.api.notice_by_id_url(state.next_id));

        // Deliberately blocking inside the state lock: dropping a listing
        // signal is worse than stalling the poller.
        let _ = titles.send(title.clone()).await;

        self.metrics.increment_counter(
            METRIC_NEW_NEWS_DETECTED_TOTAL,
            &[("fetcher", FETCHER_LABEL.to_string())],
        );

        self.notifier.send_message(format!(
            "New notice\n* NEWS INFO\nTitle: {}\n\n* RESPONSE INFO\nClient: {}\nProxy address: {}\n\nRequested at: {}\nReceived at: {}\n\nStatus: {}\nHeaders: {:?}\n\n* DELAYS INFO\nBetween requested_at and received_at: {}\n",
            title,
            response.client_name,
            response.proxy_addr,
            response.requested_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            response.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            response.status_code,
            response.headers,
            response.received_at - response.requested_at,
        ));
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> (NewsTitle, i64) {
        let state = self.state.lock().await;
        (state.last_title.clone(), state.next_id)
    }
}

/// Extract the `<meta name="description" content="…">` attribute value.
fn parse_notice_page(metrics: &dyn Metrics, response: &Response) -> Result<NewsTitle> {
    let started = std::time::Instant::now();

    let html = String::from_utf8_lossy(&response.body);
    let document = Html::parse_document(&html);
    let selector = Selector::parse(r#"meta[name="description"]"#).expect("selector is valid");

    let title = document
        .select(&selector)
        .next()
        .and_then(|element| element.value().attr("content"))
        .map(str::to_string)
        .ok_or_else(|| AppError::parse("notice page", "description meta tag not found"));

    metrics.observe_histogram(
        METRIC_NEWS_PARSE_DURATION,
        started.elapsed(),
        &[("fetcher", FETCHER_LABEL.to_string())],
    );

    title
}
