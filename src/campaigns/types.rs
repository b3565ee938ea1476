use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;

use crate::db::{OptionalRfc3339DateTime, Rfc3339DateTime};
use crate::templates::TemplateBlock;
use crate::tracking::TrackingOptions;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "scheduled" => Some(CampaignStatus::Scheduled),
            "sending" => Some(CampaignStatus::Sending),
            "completed" => Some(CampaignStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub template_blocks: Vec<TemplateBlock>,
    pub subject: String,
    pub total_recipients: i64,
    pub successful: i64,
    pub failed: i64,
    pub queued: i64,
    pub status: CampaignStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub tracking: TrackingOptions,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn decode_json<T: for<'de> Deserialize<'de>>(raw: &str, column: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(raw)
        .map_err(|e| sqlx::Error::Decode(format!("bad {column} json: {e}").into()))
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for Campaign {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;

        Ok(Campaign {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            template_blocks: decode_json(
                &row.try_get::<String, _>("template_blocks")?,
                "template_blocks",
            )?,
            subject: row.try_get("subject")?,
            total_recipients: row.try_get("total_recipients")?,
            successful: row.try_get("successful")?,
            failed: row.try_get("failed")?,
            queued: row.try_get("queued")?,
            status: CampaignStatus::from_str(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown status: {status}").into()))?,
            scheduled_for: OptionalRfc3339DateTime::try_from(
                row.try_get::<Option<String>, _>("scheduled_for")?,
            )?
            .into(),
            cc: decode_json(&row.try_get::<String, _>("cc")?, "cc")?,
            bcc: decode_json(&row.try_get::<String, _>("bcc")?, "bcc")?,
            tracking: TrackingOptions {
                open: row.try_get("track_open")?,
                click: row.try_get("track_click")?,
            },
            started_at: OptionalRfc3339DateTime::try_from(
                row.try_get::<Option<String>, _>("started_at")?,
            )?
            .into(),
            completed_at: OptionalRfc3339DateTime::try_from(
                row.try_get::<Option<String>, _>("completed_at")?,
            )?
            .into(),
            created_at: Rfc3339DateTime::try_from(row.try_get::<String, _>("created_at")?)?.into(),
        })
    }
}

/// Everything a one-shot campaign run needs up front.
#[derive(Debug, Clone)]
pub struct CampaignParams {
    pub name: String,
    pub template_blocks: Vec<TemplateBlock>,
    pub subject: String,
    pub recipients: Vec<Recipient>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub tracking: TrackingOptions,
    /// Delay between recipients; the engine default applies when `None`.
    pub pace: Option<Duration>,
}

impl CampaignParams {
    pub fn new(
        name: impl Into<String>,
        blocks: Vec<TemplateBlock>,
        subject: impl Into<String>,
        recipients: Vec<Recipient>,
    ) -> Self {
        Self {
            name: name.into(),
            template_blocks: blocks,
            subject: subject.into(),
            recipients,
            cc: Vec::new(),
            bcc: Vec::new(),
            tracking: TrackingOptions::default(),
            pace: None,
        }
    }
}

/// One event per observable step of a campaign run, serialized as
/// `{"type": "progress" | "complete" | "error", ...}` for the SSE surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    Progress {
        current: usize,
        total: usize,
        message: String,
    },
    Complete {
        campaign_id: i64,
        successful: i64,
        failed: i64,
        queued: i64,
    },
    Error {
        message: String,
    },
}

/// Result of one delivery attempt through `deliver_one`.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Sent { account_id: i64, account_name: String },
    Failed { message: String },
    NoAccount,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Success,
    Failed,
    Queued,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Success => "success",
            SendStatus::Failed => "failed",
            SendStatus::Queued => "queued",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(SendStatus::Success),
            "failed" => Some(SendStatus::Failed),
            "queued" => Some(SendStatus::Queued),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendLog {
    pub id: i64,
    pub campaign_id: i64,
    pub account_id: Option<i64>,
    pub recipient_email: String,
    pub status: SendStatus,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub sent_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for SendLog {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;

        Ok(SendLog {
            id: row.try_get("id")?,
            campaign_id: row.try_get("campaign_id")?,
            account_id: row.try_get("account_id")?,
            recipient_email: row.try_get("recipient_email")?,
            status: SendStatus::from_str(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown status: {status}").into()))?,
            error_message: row.try_get("error_message")?,
            retry_count: row.try_get("retry_count")?,
            sent_at: Rfc3339DateTime::try_from(row.try_get::<String, _>("sent_at")?)?.into(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sent => "sent",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "sent" => Some(QueueStatus::Sent),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// A recipient deferred because every account was at cap when its turn came.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: i64,
    pub campaign_id: i64,
    pub recipient_email: String,
    pub recipient_data: HashMap<String, String>,
    /// Earliest drain date, `YYYY-MM-DD`.
    pub scheduled_for: String,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for QueueEntry {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;

        Ok(QueueEntry {
            id: row.try_get("id")?,
            campaign_id: row.try_get("campaign_id")?,
            recipient_email: row.try_get("recipient_email")?,
            recipient_data: decode_json(
                &row.try_get::<String, _>("recipient_data")?,
                "recipient_data",
            )?,
            scheduled_for: row.try_get("scheduled_for")?,
            status: QueueStatus::from_str(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown status: {status}").into()))?,
            created_at: Rfc3339DateTime::try_from(row.try_get::<String, _>("created_at")?)?.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_mappings() {
        assert_eq!(CampaignStatus::Sending.as_str(), "sending");
        assert_eq!(
            CampaignStatus::from_str("completed"),
            Some(CampaignStatus::Completed)
        );
        assert_eq!(CampaignStatus::from_str("paused"), None);

        assert_eq!(SendStatus::Queued.as_str(), "queued");
        assert_eq!(QueueStatus::from_str("pending"), Some(QueueStatus::Pending));
    }

    #[test]
    fn progress_event_serializes_with_type_tag() {
        let event = ProgressEvent::Progress {
            current: 3,
            total: 10,
            message: "Sent to a@example.com via primary".into(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["current"], 3);
        assert_eq!(json["total"], 10);

        let done = ProgressEvent::Complete {
            campaign_id: 7,
            successful: 9,
            failed: 1,
            queued: 0,
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["campaignId"], 7);
    }
}
