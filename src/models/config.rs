// src/models/config.rs

use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::{Proxy, WorkSchedule};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub upbit_api: UpbitApiConfig,
    pub proxy_rotating_poller: PollerConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Optional `host:port:user:pass` file merged into the proxy list.
    #[serde(default)]
    pub proxies_file: Option<String>,
    /// Token for the ipinfo.io location lookup. Without it every client
    /// lands in the "unknown" location group.
    #[serde(default)]
    pub ipinfo_token: Option<String>,
}

/// Upstream endpoint settings. Endpoints carry a `%d` slot for the page or
/// notice ID.
#[derive(Debug, Deserialize, Clone)]
pub struct UpbitApiConfig {
    pub announcements_endpoint: String,
    pub announcements_single_ip_max_rps: f64,
    pub announcement_by_id_endpoint: String,
    pub announcement_by_id_single_ip_max_rps: f64,
    pub notice_by_id_endpoint: String,
    pub notice_by_id_single_ip_max_rps: f64,
}

impl UpbitApiConfig {
    pub fn announcements_url(&self, page: i64) -> String {
        fill_endpoint(&self.announcements_endpoint, page)
    }

    pub fn announcement_by_id_url(&self, id: i64) -> String {
        fill_endpoint(&self.announcement_by_id_endpoint, id)
    }

    pub fn notice_by_id_url(&self, id: i64) -> String {
        fill_endpoint(&self.notice_by_id_endpoint, id)
    }
}

/// Replace the single `%d` slot of an endpoint template.
pub fn fill_endpoint(template: &str, value: i64) -> String {
    template.replacen("%d", &value.to_string(), 1)
}

/// Rotating poller settings.
#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    pub target_rps: f64,
    #[serde(default)]
    pub proxies: Vec<Proxy>,
    pub work_schedule: WorkSchedule,
    pub retries: RetriesConfig,
    #[serde(default)]
    pub client: ClientKind,
}

/// Which implementation backs the proxied requesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    /// Pooled reqwest client, HTTP/2 where supported.
    #[default]
    Reqwest,
    /// Hand-rolled HTTP/1.1 client with an explicit CONNECT tunnel.
    Tunnel,
}

/// Transport-error retry policy for a single client.
#[derive(Debug, Deserialize, Clone)]
pub struct RetriesConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub retry_delay_multiplier: f64,
}

impl Default for RetriesConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            retry_delay_multiplier: 2.0,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggerConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Validate everything that does not depend on runtime state.
    ///
    /// The proxy list may still be empty here when `proxies_file` is set;
    /// the loader checks the merged list.
    pub fn validate(&self) -> Result<()> {
        for (name, endpoint) in [
            ("announcements_endpoint", &self.upbit_api.announcements_endpoint),
            (
                "announcement_by_id_endpoint",
                &self.upbit_api.announcement_by_id_endpoint,
            ),
            ("notice_by_id_endpoint", &self.upbit_api.notice_by_id_endpoint),
        ] {
            if !endpoint.contains("%d") {
                return Err(AppError::validation(format!(
                    "{name} must contain a %d slot: {endpoint}"
                )));
            }
        }

        for (name, rps) in [
            (
                "announcements_single_ip_max_rps",
                self.upbit_api.announcements_single_ip_max_rps,
            ),
            (
                "announcement_by_id_single_ip_max_rps",
                self.upbit_api.announcement_by_id_single_ip_max_rps,
            ),
            (
                "notice_by_id_single_ip_max_rps",
                self.upbit_api.notice_by_id_single_ip_max_rps,
            ),
            ("target_rps", self.proxy_rotating_poller.target_rps),
        ] {
            if rps <= 0.0 {
                return Err(AppError::validation(format!("{name} must be > 0, got {rps}")));
            }
        }

        let retries = &self.proxy_rotating_poller.retries;
        if retries.max_retries == 0 {
            return Err(AppError::validation("retries.max_retries must be > 0"));
        }
        if retries.retry_delay.is_zero() {
            return Err(AppError::validation("retries.retry_delay must be > 0"));
        }
        if retries.retry_delay_multiplier <= 0.0 {
            return Err(AppError::validation(
                "retries.retry_delay_multiplier must be > 0",
            ));
        }

        for proxy in &self.proxy_rotating_poller.proxies {
            proxy.validate()?;
        }

        self.proxy_rotating_poller.work_schedule.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_yaml() -> &'static str {
        r#"
upbit_api:
  announcements_endpoint: "https://api-manager.upbit.com/api/v1/announcements?page=%d"
  announcements_single_ip_max_rps: 0.2
  announcement_by_id_endpoint: "https://api-manager.upbit.com/api/v1/announcements/%d"
  announcement_by_id_single_ip_max_rps: 0.2
  notice_by_id_endpoint: "https://upbit.com/service_center/notice?id=%d"
  notice_by_id_single_ip_max_rps: 0.5
proxy_rotating_poller:
  target_rps: 5
  proxies:
    - host: 10.0.0.1
      port: 8080
      username: user
      password: pass
  work_schedule:
    time_zone: Asia/Seoul
    schedule:
      monday:
        start_time: "09:00"
        end_time: "18:00"
        preparation_time: 5m
  retries:
    max_retries: 3
    retry_delay: 1s
    retry_delay_multiplier: 2
"#
    }

    #[test]
    fn test_parse_sample_config() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(config.proxy_rotating_poller.target_rps, 5.0);
        assert_eq!(config.proxy_rotating_poller.proxies.len(), 1);
        assert_eq!(
            config.proxy_rotating_poller.retries.retry_delay,
            Duration::from_secs(1)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_endpoint_fill() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(
            config.upbit_api.announcements_url(1),
            "https://api-manager.upbit.com/api/v1/announcements?page=1"
        );
        assert_eq!(
            config.upbit_api.notice_by_id_url(4021),
            "https://upbit.com/service_center/notice?id=4021"
        );
    }

    #[test]
    fn test_validate_rejects_missing_slot() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.upbit_api.announcements_endpoint = "https://example.com/list".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rps() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.proxy_rotating_poller.target_rps = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_proxy_port() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.proxy_rotating_poller.proxies[0].port = 0;
        assert!(config.validate().is_err());
    }
}
