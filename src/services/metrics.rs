// src/services/metrics.rs

//! Metrics capability seam.
//!
//! The exporter is an external collaborator; the library only needs a way to
//! bump counters and observe durations. `RecorderMetrics` forwards to the
//! `metrics` facade, so whatever recorder the binary installs receives the
//! series.

use std::time::Duration;

use metrics::Label;

// Client-level series
pub const METRIC_CLIENT_REQUEST_DURATION: &str = "upbit_client_request_duration";
pub const METRIC_CLIENT_REQUESTS_TOTAL: &str = "upbit_client_requests_total";
pub const METRIC_CLIENT_ERRORS_TOTAL: &str = "upbit_client_errors_total";
pub const METRIC_CLIENT_RESPONSES_TOTAL: &str = "upbit_client_responses_total";
pub const METRIC_CLIENT_SUCCESSFUL_REQUESTS: &str = "upbit_client_successful_requests_total";
pub const METRIC_CLIENT_RATE_LIMITED_TOTAL: &str = "upbit_client_rate_limited_total";

// Poller-level series
pub const METRIC_NEWS_REQUESTS_TOTAL: &str = "upbit_news_requests_total";
pub const METRIC_NEWS_ERRORS_TOTAL: &str = "upbit_news_errors_total";
pub const METRIC_NEWS_FETCHED_TOTAL: &str = "upbit_news_fetched_total";
pub const METRIC_NEWS_REQUEST_DURATION: &str = "upbit_news_request_duration";
pub const METRIC_NEWS_POLL_DURATION: &str = "upbit_news_poll_duration";

// Fetcher-level series
pub const METRIC_NEW_NEWS_DETECTED_TOTAL: &str = "upbit_new_news_detected_total";
pub const METRIC_NEWS_PARSE_DURATION: &str = "upbit_news_parse_duration";

/// Label pair: name and value.
pub type MetricLabel = (&'static str, String);

/// Counter and histogram sink.
pub trait Metrics: Send + Sync {
    fn increment_counter(&self, name: &'static str, labels: &[MetricLabel]);
    fn observe_histogram(&self, name: &'static str, duration: Duration, labels: &[MetricLabel]);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _labels: &[MetricLabel]) {}
    fn observe_histogram(&self, _name: &'static str, _duration: Duration, _labels: &[MetricLabel]) {}
}

/// Forwards to the globally installed `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderMetrics;

impl RecorderMetrics {
    fn to_labels(labels: &[MetricLabel]) -> Vec<Label> {
        labels
            .iter()
            .map(|(name, value)| Label::new(*name, value.clone()))
            .collect()
    }
}

impl Metrics for RecorderMetrics {
    fn increment_counter(&self, name: &'static str, labels: &[MetricLabel]) {
        metrics::counter!(name, Self::to_labels(labels)).increment(1);
    }

    fn observe_histogram(&self, name: &'static str, duration: Duration, labels: &[MetricLabel]) {
        metrics::histogram!(name, Self::to_labels(labels)).record(duration.as_secs_f64());
    }
}

/// Test sink recording every event, shared across the crate's unit tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct TestMetrics {
        counters: Mutex<HashMap<String, u64>>,
        histograms: Mutex<HashMap<String, usize>>,
    }

    impl TestMetrics {
        pub fn new() -> Self {
            Self::default()
        }

        fn key(name: &str, labels: &[MetricLabel]) -> String {
            let mut key = name.to_string();
            for (label, value) in labels {
                key.push_str(&format!("|{label}={value}"));
            }
            key
        }

        /// Sum of a counter across all label sets.
        pub fn counter_total(&self, name: &str) -> u64 {
            self.counters
                .lock()
                .unwrap()
                .iter()
                .filter(|(key, _)| key.split('|').next() == Some(name))
                .map(|(_, count)| count)
                .sum()
        }

        /// Counter value for one exact label set.
        pub fn counter(&self, name: &str, labels: &[MetricLabel]) -> u64 {
            self.counters
                .lock()
                .unwrap()
                .get(&Self::key(name, labels))
                .copied()
                .unwrap_or(0)
        }
    }

    impl Metrics for TestMetrics {
        fn increment_counter(&self, name: &'static str, labels: &[MetricLabel]) {
            *self
                .counters
                .lock()
                .unwrap()
                .entry(Self::key(name, labels))
                .or_insert(0) += 1;
        }

        fn observe_histogram(
            &self,
            name: &'static str,
            _duration: Duration,
            labels: &[MetricLabel],
        ) {
            *self
                .histograms
                .lock()
                .unwrap()
                .entry(Self::key(name, labels))
                .or_insert(0) += 1;
        }
    }
}
