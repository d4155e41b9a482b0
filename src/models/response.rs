// src/models/response.rs

//! Completed HTTP request attempt, as emitted on the poller's response
//! channel.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use uuid::Uuid;

/// Proxy address used when a client talks to the upstream directly.
pub const DIRECT_PROXY_ADDR: &str = "direct";

/// One completed request attempt.
///
/// The body is already decompressed; `status_code` carries whatever the
/// upstream answered, including 429 — classification is the consumer's job.
#[derive(Debug, Clone)]
pub struct Response {
    /// Fresh unique identifier, used for log correlation.
    pub id: Uuid,
    pub requested_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Canonical proxy address, or `"direct"`.
    pub proxy_addr: String,
    /// Implementation tag of the client that produced this response.
    pub client_name: String,
}

impl Response {
    pub fn new(
        requested_at: DateTime<Utc>,
        status_code: u16,
        headers: HeaderMap,
        body: Vec<u8>,
        proxy_addr: String,
        client_name: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requested_at,
            received_at: Utc::now(),
            status_code,
            headers,
            body,
            proxy_addr,
            client_name,
        }
    }

    /// Placeholder emitted when a dispatch fails at the transport layer.
    /// Status zero never matches any consumer's accept condition.
    pub fn empty(proxy_addr: &str) -> Self {
        Self::new(
            Utc::now(),
            0,
            HeaderMap::new(),
            Vec::new(),
            proxy_addr.to_string(),
            String::new(),
        )
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == 200
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.status_code == 429
    }

    /// Seconds advertised by the `Retry-After` header, or zero when the
    /// header is absent or malformed.
    pub fn retry_after_secs(&self) -> u64 {
        self.headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Header value as a string, empty when missing. Convenience for the
    /// rate-limit diagnostics log.
    pub fn header(&self, name: &str) -> String {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}
