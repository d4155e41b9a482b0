// src/services/geo.rs

//! IP-to-location lookup used when grouping clients.
//!
//! "Location" is the timezone string ipinfo.io reports for the proxy host;
//! it only has to be stable and reasonably geographic, never precise.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppError, Result};

/// Pseudo-location for hosts whose lookup failed.
pub const UNKNOWN_LOCATION: &str = "unknown";

#[async_trait]
pub trait LocationResolver: Send + Sync {
    async fn location(&self, ip: &str) -> Result<String>;
}

#[async_trait]
impl LocationResolver for Box<dyn LocationResolver> {
    async fn location(&self, ip: &str) -> Result<String> {
        (**self).location(ip).await
    }
}

#[derive(Debug, Deserialize)]
struct IpInfoPayload {
    #[serde(default)]
    timezone: String,
}

/// ipinfo.io-backed resolver.
pub struct IpInfoResolver {
    http: reqwest::Client,
    token: String,
}

impl IpInfoResolver {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            token: token.into(),
        })
    }
}

#[async_trait]
impl LocationResolver for IpInfoResolver {
    async fn location(&self, ip: &str) -> Result<String> {
        let url = format!("https://ipinfo.io/{ip}/json?token={}", self.token);
        let payload: IpInfoPayload = self.http.get(url).send().await?.json().await?;

        if payload.timezone.is_empty() {
            return Err(AppError::validation(format!("no timezone reported for {ip}")));
        }

        Ok(payload.timezone)
    }
}

/// Map-backed resolver for tests and offline runs; unknown IPs fail the
/// lookup, which the pool maps to the "unknown" group.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    locations: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(locations: HashMap<String, String>) -> Self {
        Self { locations }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocationResolver for StaticResolver {
    async fn location(&self, ip: &str) -> Result<String> {
        self.locations
            .get(ip)
            .cloned()
            .ok_or_else(|| AppError::validation(format!("unknown ip: {ip}")))
    }
}
