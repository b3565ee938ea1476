use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::db::Rfc3339DateTime;

const TOKEN_BYTES: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub campaign_id: i64,
    pub recipient_email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingEventKind {
    Open,
    Click,
}

impl TrackingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingEventKind::Open => "open",
            TrackingEventKind::Click => "click",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    pub id: i64,
    pub token_id: i64,
    pub event_type: String,
    pub link_index: Option<i64>,
    pub url: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Mints and resolves the opaque per-(campaign, recipient) tokens embedded
/// in outgoing mail. Sequence sends reuse the same table with
/// `campaign_id = -sequence_id`.
#[derive(Clone)]
pub struct TokenService {
    pool: SqlitePool,
}

impl TokenService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent mint: concurrent calls for the same key converge on one
    /// token through the table's uniqueness constraint and a re-read.
    pub async fn get_or_create(
        &self,
        campaign_id: i64,
        recipient_email: &str,
    ) -> Result<String, TokenError> {
        if let Some(existing) = self.lookup(campaign_id, recipient_email).await? {
            return Ok(existing);
        }

        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        sqlx::query(
            r#"
            INSERT INTO tracking_tokens (campaign_id, recipient_email, token, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(campaign_id)
        .bind(recipient_email)
        .bind(&token)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        // A concurrent mint may have won the insert; the stored row is
        // authoritative either way.
        self.lookup(campaign_id, recipient_email)
            .await?
            .ok_or(TokenError::Database(sqlx::Error::RowNotFound))
    }

    async fn lookup(
        &self,
        campaign_id: i64,
        recipient_email: &str,
    ) -> Result<Option<String>, TokenError> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT token FROM tracking_tokens WHERE campaign_id = ?1 AND recipient_email = ?2",
        )
        .bind(campaign_id)
        .bind(recipient_email)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn token_details(&self, token: &str) -> Result<Option<TokenDetails>, TokenError> {
        let row = sqlx::query(
            "SELECT campaign_id, recipient_email FROM tracking_tokens WHERE token = ?1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(TokenDetails {
                campaign_id: row.try_get("campaign_id")?,
                recipient_email: row.try_get("recipient_email")?,
            })),
            None => Ok(None),
        }
    }

    /// Appends an open/click event. Returns false when the token is unknown,
    /// which callers treat as a stale or forged reference.
    pub async fn record_event(
        &self,
        token: &str,
        kind: TrackingEventKind,
        link_index: Option<i64>,
        url: Option<&str>,
    ) -> Result<bool, TokenError> {
        let token_id =
            sqlx::query_scalar::<_, i64>("SELECT id FROM tracking_tokens WHERE token = ?1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;

        let Some(token_id) = token_id else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            INSERT INTO tracking_events (token_id, event_type, link_index, url, occurred_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(token_id)
        .bind(kind.as_str())
        .bind(link_index)
        .bind(url)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    pub async fn events_for_campaign(
        &self,
        campaign_id: i64,
    ) -> Result<Vec<TrackingEvent>, TokenError> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.token_id, e.event_type, e.link_index, e.url, e.occurred_at
            FROM tracking_events e
            JOIN tracking_tokens t ON t.id = e.token_id
            WHERE t.campaign_id = ?1
            ORDER BY e.occurred_at ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(TrackingEvent {
                id: row.try_get("id")?,
                token_id: row.try_get("token_id")?,
                event_type: row.try_get("event_type")?,
                link_index: row.try_get("link_index")?,
                url: row.try_get("url")?,
                occurred_at: Rfc3339DateTime::try_from(row.try_get::<String, _>("occurred_at")?)?
                    .into(),
            });
        }

        Ok(events)
    }
}
