// src/models/mod.rs

//! Data structures shared across the poller.

mod announcement;
mod config;
mod proxy;
mod response;
mod work_schedule;

pub use announcement::{Announcements, AnnouncementsData, NewsTitle, Notice, SingleAnnouncement};
pub use config::{
    fill_endpoint, ClientKind, Config, LoggerConfig, PollerConfig, RetriesConfig, UpbitApiConfig,
};
pub use proxy::Proxy;
pub use response::{Response, DIRECT_PROXY_ADDR};
pub use work_schedule::{DailySchedule, Weekday, WorkSchedule};
