use chrono::{DateTime, Utc};
use sqlx::Error as SqlxError;
use sqlx::SqlitePool;
use std::path::Path;

/// Opens (creating if necessary) the engine database at `path`.
pub async fn create_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());
    SqlitePool::connect(&db_url).await
}

/// In-memory database, used by tests and throwaway runs. Pinned to a single
/// connection: every sqlite `:memory:` connection is its own database.
pub async fn create_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
}

pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sender_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            provider_kind TEXT NOT NULL,
            encrypted_config TEXT NOT NULL,
            daily_cap INTEGER NOT NULL,
            campaign_cap INTEGER NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            circuit_breaker_until TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS send_counts (
            account_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            UNIQUE(account_id, date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS campaigns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            template_blocks TEXT NOT NULL,
            subject TEXT NOT NULL,
            total_recipients INTEGER NOT NULL DEFAULT 0,
            successful INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            queued INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'draft',
            scheduled_for TEXT,
            cc TEXT NOT NULL DEFAULT '[]',
            bcc TEXT NOT NULL DEFAULT '[]',
            track_open INTEGER NOT NULL DEFAULT 0,
            track_click INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS send_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id INTEGER NOT NULL,
            account_id INTEGER,
            recipient_email TEXT NOT NULL,
            status TEXT NOT NULL,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            sent_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS send_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id INTEGER NOT NULL,
            recipient_email TEXT NOT NULL,
            recipient_data TEXT NOT NULL DEFAULT '{}',
            scheduled_for TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracking_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id INTEGER NOT NULL,
            recipient_email TEXT NOT NULL,
            token TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            UNIQUE(campaign_id, recipient_email)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracking_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_id INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            link_index INTEGER,
            url TEXT,
            occurred_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recurring_campaigns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            template_blocks TEXT NOT NULL,
            subject TEXT NOT NULL,
            recipient_source TEXT NOT NULL,
            cron_expr TEXT NOT NULL,
            timezone TEXT NOT NULL DEFAULT 'UTC',
            cc TEXT NOT NULL DEFAULT '[]',
            bcc TEXT NOT NULL DEFAULT '[]',
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT,
            next_run_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sequences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sequence_steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sequence_id INTEGER NOT NULL,
            step_order INTEGER NOT NULL,
            subject TEXT NOT NULL,
            template_blocks TEXT NOT NULL,
            delay_days INTEGER NOT NULL DEFAULT 0,
            delay_hours INTEGER NOT NULL DEFAULT 0,
            send_time TEXT,
            UNIQUE(sequence_id, step_order)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sequence_enrollments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sequence_id INTEGER NOT NULL,
            recipient_email TEXT NOT NULL,
            recipient_data TEXT NOT NULL DEFAULT '{}',
            current_step INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            next_send_at TEXT,
            enrolled_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_accounts_enabled ON sender_accounts(enabled, priority)",
        "CREATE INDEX IF NOT EXISTS idx_send_counts_lookup ON send_counts(account_id, date)",
        "CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status)",
        "CREATE INDEX IF NOT EXISTS idx_send_logs_campaign ON send_logs(campaign_id)",
        "CREATE INDEX IF NOT EXISTS idx_send_logs_account ON send_logs(campaign_id, account_id)",
        "CREATE INDEX IF NOT EXISTS idx_queue_pending ON send_queue(status, scheduled_for)",
        "CREATE INDEX IF NOT EXISTS idx_tokens_lookup ON tracking_tokens(campaign_id, recipient_email)",
        "CREATE INDEX IF NOT EXISTS idx_events_token ON tracking_events(token_id)",
        "CREATE INDEX IF NOT EXISTS idx_recurring_due ON recurring_campaigns(enabled, next_run_at)",
        "CREATE INDEX IF NOT EXISTS idx_enrollments_due ON sequence_enrollments(status, next_send_at)",
    ];

    for stmt in indexes {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct Rfc3339DateTime(pub DateTime<Utc>);

impl TryFrom<String> for Rfc3339DateTime {
    type Error = SqlxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DateTime::parse_from_rfc3339(&value)
            .map(|dt| Rfc3339DateTime(dt.with_timezone(&Utc)))
            .map_err(|e| SqlxError::Decode(Box::new(e)))
    }
}

impl From<Rfc3339DateTime> for DateTime<Utc> {
    fn from(value: Rfc3339DateTime) -> Self {
        value.0
    }
}

#[derive(Debug, Clone)]
pub struct OptionalRfc3339DateTime(pub Option<DateTime<Utc>>);

impl TryFrom<Option<String>> for OptionalRfc3339DateTime {
    type Error = SqlxError;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        match value {
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| OptionalRfc3339DateTime(Some(dt.with_timezone(&Utc))))
                .map_err(|e| SqlxError::Decode(Box::new(e))),
            None => Ok(OptionalRfc3339DateTime(None)),
        }
    }
}

impl From<OptionalRfc3339DateTime> for Option<DateTime<Utc>> {
    fn from(value: OptionalRfc3339DateTime) -> Self {
        value.0
    }
}

/// Today's UTC date in the `YYYY-MM-DD` form used by `send_counts` and
/// `send_queue.scheduled_for`.
pub fn utc_today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

pub fn utc_tomorrow() -> String {
    (Utc::now().date_naive() + chrono::Duration::days(1))
        .format("%Y-%m-%d")
        .to_string()
}
