// src/utils/tickers.rs

//! Ticker extraction from listing announcement titles.

use std::sync::OnceLock;

use regex::Regex;

const LISTING_PREFIX: &str = "Market Support for";

fn ticker_regex() -> &'static Regex {
    static TICKER: OnceLock<Regex> = OnceLock::new();
    TICKER.get_or_init(|| Regex::new(r"\(([A-Z0-9]{2,10})\)").expect("ticker regex is valid"))
}

/// Extract tickers from Korean listing titles: every 2–10 character
/// uppercase-alphanumeric token enclosed in parentheses, in document order.
pub fn extract_korean_tickers(message: &str) -> Vec<String> {
    ticker_regex()
        .captures_iter(message)
        .map(|captures| captures[1].to_string())
        .collect()
}

/// Extract tickers from English "Market Support for …" titles.
///
/// Handles both shapes the upstream uses: `Name(TICKER)` pairs and bare
/// comma-separated tickers, with an optional trailing `(… Market)` suffix.
pub fn extract_tickers(message: &str) -> Vec<String> {
    let message = message
        .strip_prefix(LISTING_PREFIX)
        .unwrap_or(message)
        .trim();

    split_top_level(message)
        .into_iter()
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }

            if let Some(captures) = ticker_regex().captures(part) {
                return Some(captures[1].to_string());
            }

            // Bare ticker, possibly followed by a market suffix.
            let bare = part.split('(').next().unwrap_or_default().trim();
            (!bare.is_empty()).then(|| bare.to_string())
        })
        .collect()
}

/// Split on commas outside parentheses.
fn split_top_level(message: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (index, ch) in message.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&message[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&message[start..]);

    parts
}
