//! Upbit listing poller library.
//!
//! A high-frequency polling engine that watches the Upbit announcement and
//! notice endpoints for new listings and emits each newly observed title the
//! moment it is detected.
//!
//! # Architecture
//!
//! - `models`: Data structures (config, proxies, responses, payloads, work schedule)
//! - `services`: Clients, the location-grouped pool, the rotating poller, capability seams
//! - `fetchers`: Change detection on top of the poller, plus the listing monitor
//! - `utils`: Broadcast fan-out, ticker extraction, proxy file loading
//! - `config`: YAML loading with environment overrides
//! - `error`: Unified error handling

pub mod config;
pub mod error;
pub mod fetchers;
pub mod logging;
pub mod models;
pub mod services;
pub mod utils;

// Re-export commonly used items
pub use error::{AppError, Result};
