// src/config.rs

//! Configuration loading utilities.
//!
//! Loads the YAML configuration, applies `UPBITAP_`-prefixed environment
//! overrides, merges in the optional proxy wire file, and validates the
//! result.

use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use crate::error::{AppError, Result};
use crate::models::Config;
use crate::utils::proxy_file::load_proxies;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "UPBITAP";

/// Load, override, merge, and validate the full configuration.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| AppError::config(format!("failed to read {}: {e}", path.display())))?;
    let mut config: Config = serde_yaml::from_str(&contents)?;

    apply_env_overrides(&mut config);
    config.validate()?;

    if let Some(proxies_file) = config.proxies_file.clone() {
        let extra = load_proxies(Path::new(&proxies_file))?;
        for proxy in extra {
            if !config.proxy_rotating_poller.proxies.contains(&proxy) {
                config.proxy_rotating_poller.proxies.push(proxy);
            }
        }
    }

    if config.proxy_rotating_poller.proxies.is_empty() {
        return Err(AppError::NoProxies);
    }

    Ok(config)
}

/// Apply `UPBITAP_<SECTION>_<FIELD>` environment overrides to every leaf
/// option. The key table is the Rust stand-in for tag-driven binding.
pub fn apply_env_overrides(config: &mut Config) {
    let api = &mut config.upbit_api;
    override_value("UPBIT_API_ANNOUNCEMENTS_ENDPOINT", &mut api.announcements_endpoint);
    override_parsed(
        "UPBIT_API_ANNOUNCEMENTS_SINGLE_IP_MAX_RPS",
        &mut api.announcements_single_ip_max_rps,
    );
    override_value(
        "UPBIT_API_ANNOUNCEMENT_BY_ID_ENDPOINT",
        &mut api.announcement_by_id_endpoint,
    );
    override_parsed(
        "UPBIT_API_ANNOUNCEMENT_BY_ID_SINGLE_IP_MAX_RPS",
        &mut api.announcement_by_id_single_ip_max_rps,
    );
    override_value("UPBIT_API_NOTICE_BY_ID_ENDPOINT", &mut api.notice_by_id_endpoint);
    override_parsed(
        "UPBIT_API_NOTICE_BY_ID_SINGLE_IP_MAX_RPS",
        &mut api.notice_by_id_single_ip_max_rps,
    );

    let poller = &mut config.proxy_rotating_poller;
    override_parsed("PROXY_ROTATING_POLLER_TARGET_RPS", &mut poller.target_rps);
    override_value(
        "PROXY_ROTATING_POLLER_WORK_SCHEDULE_TIME_ZONE",
        &mut poller.work_schedule.time_zone,
    );
    override_parsed(
        "PROXY_ROTATING_POLLER_RETRIES_MAX_RETRIES",
        &mut poller.retries.max_retries,
    );
    override_duration(
        "PROXY_ROTATING_POLLER_RETRIES_RETRY_DELAY",
        &mut poller.retries.retry_delay,
    );
    override_parsed(
        "PROXY_ROTATING_POLLER_RETRIES_RETRY_DELAY_MULTIPLIER",
        &mut poller.retries.retry_delay_multiplier,
    );

    override_value("LOGGER_LEVEL", &mut config.logger.level);
    override_value("LOGGER_FORMAT", &mut config.logger.format);

    if let Some(value) = env_var("PROXIES_FILE") {
        config.proxies_file = Some(value);
    }
    if let Some(value) = env_var("IPINFO_TOKEN") {
        config.ipinfo_token = Some(value);
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}_{key}")).ok()
}

fn override_value(key: &str, target: &mut String) {
    if let Some(value) = env_var(key) {
        *target = value;
    }
}

fn override_parsed<T: FromStr>(key: &str, target: &mut T) {
    if let Some(value) = env_var(key) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value, "ignoring unparseable environment override"),
        }
    }
}

fn override_duration(key: &str, target: &mut std::time::Duration) {
    if let Some(value) = env_var(key) {
        match humantime::parse_duration(&value) {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value, "ignoring unparseable environment override"),
        }
    }
}
