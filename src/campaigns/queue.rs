use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::executor::{CampaignError, CampaignExecutor};
use super::types::{Campaign, DeliveryOutcome, QueueEntry, QueueStatus, Recipient, SendStatus};
use crate::db::utc_today;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub processed: u64,
    pub failed: u64,
}

/// Daily catch-up over recipients that were deferred because no account had
/// capacity. One attempt per entry per drain; anything left `pending` waits
/// for the next tick.
#[derive(Clone)]
pub struct QueueProcessor {
    pool: SqlitePool,
    executor: CampaignExecutor,
}

impl QueueProcessor {
    pub fn new(pool: SqlitePool, executor: CampaignExecutor) -> Self {
        Self { pool, executor }
    }

    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        let entries = sqlx::query_as::<_, QueueEntry>(
            r#"
            SELECT id, campaign_id, recipient_email, recipient_data, scheduled_for, status, created_at
            FROM send_queue
            WHERE status = 'pending' AND scheduled_for <= ?1
            ORDER BY id ASC
            "#,
        )
        .bind(utc_today())
        .fetch_all(&self.pool)
        .await?;

        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        info!(pending = entries.len(), "draining send queue");
        let mut report = DrainReport::default();

        for entry in entries {
            let campaign = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?1")
                .bind(entry.campaign_id)
                .fetch_optional(&self.pool)
                .await?;

            let Some(campaign) = campaign else {
                warn!(
                    entry_id = entry.id,
                    campaign_id = entry.campaign_id,
                    "queued recipient references a missing campaign"
                );
                self.settle(&entry, QueueStatus::Failed).await?;
                self.executor
                    .logs()
                    .insert(
                        entry.campaign_id,
                        None,
                        &entry.recipient_email,
                        SendStatus::Failed,
                        Some("Campaign not found"),
                        0,
                    )
                    .await?;
                self.adjust_campaign(entry.campaign_id, "failed").await?;
                report.failed += 1;
                continue;
            };

            let recipient = Recipient {
                email: entry.recipient_email.clone(),
                data: entry.recipient_data.clone(),
            };

            let outcome = self
                .executor
                .deliver_one(
                    campaign.id,
                    &recipient,
                    &campaign.subject,
                    &campaign.template_blocks,
                    &campaign.cc,
                    &campaign.bcc,
                    campaign.tracking,
                )
                .await?;

            match outcome {
                DeliveryOutcome::Sent { .. } => {
                    self.settle(&entry, QueueStatus::Sent).await?;
                    self.adjust_campaign(campaign.id, "successful").await?;
                    report.processed += 1;
                }
                DeliveryOutcome::Failed { message } => {
                    warn!(entry_id = entry.id, error = %message, "queued delivery failed");
                    self.settle(&entry, QueueStatus::Failed).await?;
                    self.adjust_campaign(campaign.id, "failed").await?;
                    report.failed += 1;
                }
                DeliveryOutcome::NoAccount => {
                    // Still no capacity; everything after this entry stays
                    // pending for the next drain.
                    info!(entry_id = entry.id, "no account available, stopping drain");
                    break;
                }
            }
        }

        info!(
            processed = report.processed,
            failed = report.failed,
            "queue drain finished"
        );
        Ok(report)
    }

    async fn settle(&self, entry: &QueueEntry, status: QueueStatus) -> Result<(), QueueError> {
        sqlx::query("UPDATE send_queue SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(entry.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Moves one unit from `queued` to the resolved column, then closes the
    /// campaign once every recipient is accounted for. Increments stay at the
    /// SQL level so concurrent drains of the same campaign compose.
    async fn adjust_campaign(&self, campaign_id: i64, resolved: &str) -> Result<(), QueueError> {
        let sql = match resolved {
            "successful" => {
                "UPDATE campaigns SET successful = successful + 1, queued = queued - 1 WHERE id = ?1"
            }
            _ => "UPDATE campaigns SET failed = failed + 1, queued = queued - 1 WHERE id = ?1",
        };

        sqlx::query(sql).bind(campaign_id).execute(&self.pool).await?;

        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'completed', completed_at = ?1
            WHERE id = ?2 AND completed_at IS NULL AND successful + failed >= total_recipients
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
