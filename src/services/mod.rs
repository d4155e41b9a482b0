// src/services/mod.rs

//! Service layer: clients, pooling, scheduling, and the capability seams.

pub mod client;
pub mod encoding;
pub mod geo;
pub mod metrics;
pub mod notifier;
pub mod pool;
pub mod poller;
pub mod tunnel;

pub use client::{HttpPollClient, PollClient, RESPONSE_TIMEOUT, USER_AGENT};
pub use geo::{IpInfoResolver, LocationResolver, StaticResolver, UNKNOWN_LOCATION};
pub use metrics::{Metrics, NoopMetrics, RecorderMetrics};
pub use notifier::{LogNotifier, NoopNotifier, Notifier, MESSAGE_CHUNK_LIMIT};
pub use pool::ClientQueuePool;
pub use poller::{RotatingPoller, RotatingPollerBuilder};
pub use tunnel::{ProxyEndpoint, TunnelClient};
