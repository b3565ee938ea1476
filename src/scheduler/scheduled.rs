use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use super::ScheduleError;

/// Promotes time-scheduled campaigns to `sending` once their moment passes.
/// The actual send is driven by whoever consumes the status transition.
#[derive(Clone)]
pub struct ScheduledDispatcher {
    pool: SqlitePool,
}

impl ScheduledDispatcher {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Flips due `scheduled` rows to `sending`, stamping `started_at`.
    /// Returns the promoted campaign ids in id order.
    pub async fn promote_due(&self) -> Result<Vec<i64>, ScheduleError> {
        let now = Utc::now().to_rfc3339();

        let due = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM campaigns
            WHERE status = 'scheduled' AND scheduled_for IS NOT NULL AND scheduled_for <= ?1
            ORDER BY id ASC
            "#,
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;

        for id in &due {
            sqlx::query(
                "UPDATE campaigns SET status = 'sending', started_at = ?1 WHERE id = ?2 AND status = 'scheduled'",
            )
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;

            info!(campaign_id = id, "scheduled campaign promoted to sending");
        }

        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;
    use chrono::Duration;

    async fn seed_campaign(pool: &SqlitePool, status: &str, scheduled_for: Option<String>) -> i64 {
        let result = sqlx::query(
            r#"
            INSERT INTO campaigns
                (name, template_blocks, subject, total_recipients, status, scheduled_for, created_at)
            VALUES ('c', '[]', 's', 0, ?1, ?2, ?3)
            "#,
        )
        .bind(status)
        .bind(scheduled_for)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await
        .unwrap();
        result.last_insert_rowid()
    }

    #[tokio::test]
    async fn promotes_only_due_scheduled_campaigns() {
        let pool = crate::db::create_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let dispatcher = ScheduledDispatcher::new(pool.clone());

        let past = (Utc::now() - Duration::minutes(5)).to_rfc3339();
        let future = (Utc::now() + Duration::hours(1)).to_rfc3339();

        let due = seed_campaign(&pool, "scheduled", Some(past.clone())).await;
        let not_yet = seed_campaign(&pool, "scheduled", Some(future)).await;
        let draft = seed_campaign(&pool, "draft", Some(past)).await;

        let promoted = dispatcher.promote_due().await.unwrap();
        assert_eq!(promoted, vec![due]);

        let status: String = sqlx::query_scalar("SELECT status FROM campaigns WHERE id = ?1")
            .bind(due)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "sending");

        let started: Option<String> =
            sqlx::query_scalar("SELECT started_at FROM campaigns WHERE id = ?1")
                .bind(due)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(started.is_some());

        for untouched in [not_yet, draft] {
            let status: String = sqlx::query_scalar("SELECT status FROM campaigns WHERE id = ?1")
                .bind(untouched)
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_ne!(status, "sending");
        }
    }

    #[tokio::test]
    async fn promotion_is_idempotent_across_ticks() {
        let pool = crate::db::create_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let dispatcher = ScheduledDispatcher::new(pool.clone());

        let past = (Utc::now() - Duration::minutes(5)).to_rfc3339();
        seed_campaign(&pool, "scheduled", Some(past)).await;

        assert_eq!(dispatcher.promote_due().await.unwrap().len(), 1);
        assert!(dispatcher.promote_due().await.unwrap().is_empty());
    }
}
