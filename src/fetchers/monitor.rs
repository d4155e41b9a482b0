// src/fetchers/monitor.rs

//! Listing monitor: watches one broadcast follower for titles that announce
//! new market support and surfaces the extracted tickers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::NewsTitle;
use crate::services::notifier::Notifier;
use crate::utils::broadcast::Follower;
use crate::utils::tickers::extract_korean_tickers;

const ENGLISH_LISTING_PREFIX: &str = "Market Support for";

const KOREAN_LISTING_PATTERNS: [&str; 3] = ["신규 거래지원 안내", "디지털 자산 추가", "상장 안내"];

/// Whether a title announces a new listing.
pub fn is_listing_title(title: &str) -> bool {
    title.contains(ENGLISH_LISTING_PREFIX)
        || KOREAN_LISTING_PATTERNS
            .iter()
            .any(|pattern| title.contains(pattern))
}

pub struct NewsMonitor {
    notifier: Arc<dyn Notifier>,
}

impl NewsMonitor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Consume the follower until it closes or the token fires.
    pub async fn run(&self, mut titles: Follower<NewsTitle>, token: CancellationToken) {
        loop {
            let title = tokio::select! {
                _ = token.cancelled() => {
                    info!("background monitoring stopped");
                    return;
                }
                title = titles.recv() => match title {
                    Some(title) => title,
                    None => {
                        info!("title stream closed, monitoring stopped");
                        return;
                    }
                },
            };

            info!(title = %title, "received news");

            if !is_listing_title(&title) {
                continue;
            }

            let tickers = extract_korean_tickers(&title);
            info!(title = %title, tickers = ?tickers, "listing news detected");

            self.notifier.send_message(format!(
                "Listing news detected\nTitle: {title}\nTickers: {tickers:?}"
            ));
        }
    }
}
