// src/models/work_schedule.rs

//! Timezone-aware work schedule gating the poller.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{Datelike, Days, Duration, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::error::{AppError, Result};

/// Weekday keys as they appear in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Weekday {
    pub fn next(self) -> Self {
        match self {
            Weekday::Sunday => Weekday::Monday,
            Weekday::Monday => Weekday::Tuesday,
            Weekday::Tuesday => Weekday::Wednesday,
            Weekday::Wednesday => Weekday::Thursday,
            Weekday::Thursday => Weekday::Friday,
            Weekday::Friday => Weekday::Saturday,
            Weekday::Saturday => Weekday::Sunday,
        }
    }

    fn from_chrono(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Sun => Weekday::Sunday,
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
        }
    }
}

/// Work window of a single day. Times are "HH:MM" strings in the schedule's
/// time zone; `preparation_time` widens the window on both sides.
#[derive(Debug, Clone, Deserialize)]
pub struct DailySchedule {
    pub start_time: String,
    pub end_time: String,
    #[serde(default, with = "humantime_serde")]
    pub preparation_time: StdDuration,
}

/// The full schedule: an IANA time zone plus per-weekday windows.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkSchedule {
    pub time_zone: String,
    #[serde(default)]
    pub schedule: HashMap<Weekday, DailySchedule>,
}

impl WorkSchedule {
    pub fn new(time_zone: impl Into<String>) -> Self {
        Self {
            time_zone: time_zone.into(),
            schedule: HashMap::new(),
        }
    }

    /// Set the window for one day.
    ///
    /// Malformed `HH:MM` strings, `start > end`, and an invalid time zone are
    /// programmer errors and panic.
    pub fn set_daily_schedule(
        &mut self,
        day: Weekday,
        start_time: &str,
        end_time: &str,
        preparation_time: StdDuration,
    ) {
        let start = parse_hhmm(start_time);
        let end = parse_hhmm(end_time);
        if start > end {
            panic!("start time {start_time} is after end time {end_time}");
        }
        self.tz();

        self.schedule.insert(
            day,
            DailySchedule {
                start_time: start_time.to_string(),
                end_time: end_time.to_string(),
                preparation_time,
            },
        );
    }

    /// Validate the configured windows without panicking. Used by config
    /// loading, where schedule mistakes are user errors.
    pub fn validate(&self) -> Result<()> {
        if self.time_zone.parse::<Tz>().is_err() {
            return Err(AppError::validation(format!(
                "invalid time zone: {}",
                self.time_zone
            )));
        }

        for (day, daily) in &self.schedule {
            let start = NaiveTime::parse_from_str(&daily.start_time, "%H:%M").map_err(|_| {
                AppError::validation(format!("invalid start_time for {day:?}: {}", daily.start_time))
            })?;
            let end = NaiveTime::parse_from_str(&daily.end_time, "%H:%M").map_err(|_| {
                AppError::validation(format!("invalid end_time for {day:?}: {}", daily.end_time))
            })?;
            if start > end {
                return Err(AppError::validation(format!(
                    "start_time after end_time for {day:?}"
                )));
            }
        }

        Ok(())
    }

    fn tz(&self) -> Tz {
        self.time_zone
            .parse::<Tz>()
            .unwrap_or_else(|_| panic!("invalid time zone: {}", self.time_zone))
    }

    fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.tz()).naive_local()
    }

    /// Whether we are inside today's preparation-widened window right now.
    pub fn work_now(&self) -> bool {
        self.work_now_at(self.local_now())
    }

    pub(crate) fn work_now_at(&self, now: NaiveDateTime) -> bool {
        let day = Weekday::from_chrono(now.weekday());
        match self.window_at(day, now.date()) {
            Some((start, end)) => now > start && now < end,
            None => false,
        }
    }

    /// Time until the next work session.
    ///
    /// Returns zero while inside today's window, a positive duration before
    /// it, and a **negative** duration (`end_today − now`) once today's
    /// window has passed — callers that sleep on the result must clamp at
    /// zero. Fails with `NoWorkSession` when no day of the week has a window.
    pub fn next_work_session(&self) -> Result<Duration> {
        self.next_work_session_at(self.local_now())
    }

    pub(crate) fn next_work_session_at(&self, now: NaiveDateTime) -> Result<Duration> {
        let today = Weekday::from_chrono(now.weekday());

        if let Some((start, end)) = self.window_at(today, now.date()) {
            if now > start && now < end {
                return Ok(Duration::zero());
            }
            if now <= start {
                return Ok(start - now);
            }
            return Ok(end - now);
        }

        let mut day = today;
        for offset in 1..7u64 {
            day = day.next();
            let date = now.date() + Days::new(offset);
            if let Some((start, _)) = self.window_at(day, date) {
                return Ok(start - now);
            }
        }

        Err(AppError::NoWorkSession)
    }

    fn window_at(
        &self,
        day: Weekday,
        date: chrono::NaiveDate,
    ) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let daily = self.schedule.get(&day)?;

        let start = NaiveTime::parse_from_str(&daily.start_time, "%H:%M")
            .unwrap_or_else(|_| panic!("invalid start time: {}", daily.start_time));
        let end = NaiveTime::parse_from_str(&daily.end_time, "%H:%M")
            .unwrap_or_else(|_| panic!("invalid end time: {}", daily.end_time));

        let preparation = Duration::from_std(daily.preparation_time).unwrap_or_default();

        Some((
            date.and_time(start) - preparation,
            date.and_time(end) + preparation,
        ))
    }
}

fn parse_hhmm(value: &str) -> NaiveTime {
    NaiveTime::parse_from_str(value, "%H:%M")
        .unwrap_or_else(|_| panic!("invalid HH:MM time: {value}"))
}
