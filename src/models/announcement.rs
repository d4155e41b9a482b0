// src/models/announcement.rs

//! Upstream announcement payload shapes.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A news title as it travels through the pipeline.
pub type NewsTitle = String;

/// One announcement record.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Notice {
    pub id: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub listed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_listed_at: Option<DateTime<Utc>>,
}

/// Envelope of the announcements-list endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Announcements {
    pub success: bool,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub data: AnnouncementsData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnouncementsData {
    #[serde(default)]
    pub total_pages: i64,
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub notices: Vec<Notice>,
}

/// Envelope of the announcement-by-id endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SingleAnnouncement {
    pub success: bool,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub data: Notice,
}

impl SingleAnnouncement {
    /// The upstream's "no such ID yet" marker.
    pub fn is_empty_sentinel(&self) -> bool {
        !self.success && self.error_code == -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_announcements_list() {
        let body = r#"{
            "success": true,
            "data": {
                "total_pages": 10,
                "total_count": 193,
                "notices": [
                    {
                        "id": 4021,
                        "category": "Trade",
                        "title": "Market Support for Celestia(TIA)",
                        "listed_at": "2026-07-01T09:00:00+09:00",
                        "first_listed_at": "2026-07-01T09:00:00+09:00"
                    },
                    {"id": 4019, "category": "Notice", "title": "Wallet maintenance"}
                ]
            }
        }"#;

        let parsed: Announcements = serde_json::from_str(body).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.data.notices.len(), 2);
        assert_eq!(parsed.data.notices[0].id, 4021);
        assert!(parsed.data.notices[0].listed_at.is_some());
        assert!(parsed.data.notices[1].listed_at.is_none());
    }

    #[test]
    fn test_parse_single_announcement() {
        let body = r#"{
            "success": true,
            "data": {"id": 4022, "category": "Trade", "title": "New listing"}
        }"#;

        let parsed: SingleAnnouncement = serde_json::from_str(body).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.data.id, 4022);
        assert!(!parsed.is_empty_sentinel());
    }

    #[test]
    fn test_empty_sentinel() {
        let body = r#"{"success": false, "error_code": -1, "error_message": "not found"}"#;

        let parsed: SingleAnnouncement = serde_json::from_str(body).unwrap();
        assert!(parsed.is_empty_sentinel());
    }

    #[test]
    fn test_failure_that_is_not_the_sentinel() {
        let body = r#"{"success": false, "error_code": 500, "error_message": "boom"}"#;

        let parsed: SingleAnnouncement = serde_json::from_str(body).unwrap();
        assert!(!parsed.is_empty_sentinel());
    }
}
