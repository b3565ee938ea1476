use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;

use super::types::{SendLog, SendStatus};

/// Per-campaign totals derived straight from `send_logs`, independent of the
/// counters on the campaign row.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStats {
    pub successful: i64,
    pub failed: i64,
    pub queued: i64,
}

/// Append-only log of delivery attempts.
#[derive(Clone)]
pub struct SendLogger {
    pool: SqlitePool,
}

impl SendLogger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        &self,
        campaign_id: i64,
        account_id: Option<i64>,
        recipient_email: &str,
        status: SendStatus,
        error_message: Option<&str>,
        retry_count: i64,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO send_logs
                (campaign_id, account_id, recipient_email, status, error_message, retry_count, sent_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(campaign_id)
        .bind(account_id)
        .bind(recipient_email)
        .bind(status.as_str())
        .bind(error_message)
        .bind(retry_count)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn logs_for_campaign(
        &self,
        campaign_id: i64,
        limit: i64,
    ) -> Result<Vec<SendLog>, sqlx::Error> {
        sqlx::query_as::<_, SendLog>(
            r#"
            SELECT id, campaign_id, account_id, recipient_email, status, error_message, retry_count, sent_at
            FROM send_logs
            WHERE campaign_id = ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
        )
        .bind(campaign_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn campaign_stats(&self, campaign_id: i64) -> Result<CampaignStats, sqlx::Error> {
        let successful = self.count_status(campaign_id, SendStatus::Success).await?;
        let failed = self.count_status(campaign_id, SendStatus::Failed).await?;
        let queued = self.count_status(campaign_id, SendStatus::Queued).await?;

        Ok(CampaignStats {
            successful,
            failed,
            queued,
        })
    }

    async fn count_status(
        &self,
        campaign_id: i64,
        status: SendStatus,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM send_logs WHERE campaign_id = ?1 AND status = ?2",
        )
        .bind(campaign_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await
    }
}
