// src/utils/mod.rs

//! Shared utilities.

pub mod broadcast;
pub mod proxy_file;
pub mod tickers;

pub use broadcast::{broadcast_adapter, Broadcast, Follower};
pub use proxy_file::{load_proxies, parse_proxies};
pub use tickers::{extract_korean_tickers, extract_tickers};
