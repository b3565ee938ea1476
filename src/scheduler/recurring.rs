use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, error, info, warn};

use super::ScheduleError;
use crate::campaigns::executor::CampaignExecutor;
use crate::campaigns::types::{CampaignParams, Recipient};
use crate::db::{OptionalRfc3339DateTime, Rfc3339DateTime};
use crate::templates::TemplateBlock;

/// Where a recurring campaign finds its recipients at each fire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecipientSource {
    Inline { recipients: Vec<Recipient> },
    CsvUrl { url: String },
    JsonUrl { url: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringCampaign {
    pub id: i64,
    pub name: String,
    pub template_blocks: Vec<TemplateBlock>,
    pub subject: String,
    pub recipient_source: RecipientSource,
    pub cron_expr: String,
    pub timezone: String,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for RecurringCampaign {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        fn decode<T: for<'de> Deserialize<'de>>(raw: &str, col: &str) -> Result<T, sqlx::Error> {
            serde_json::from_str(raw)
                .map_err(|e| sqlx::Error::Decode(format!("bad {col} json: {e}").into()))
        }

        Ok(RecurringCampaign {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            template_blocks: decode(
                &row.try_get::<String, _>("template_blocks")?,
                "template_blocks",
            )?,
            subject: row.try_get("subject")?,
            recipient_source: decode(
                &row.try_get::<String, _>("recipient_source")?,
                "recipient_source",
            )?,
            cron_expr: row.try_get("cron_expr")?,
            timezone: row.try_get("timezone")?,
            cc: decode(&row.try_get::<String, _>("cc")?, "cc")?,
            bcc: decode(&row.try_get::<String, _>("bcc")?, "bcc")?,
            enabled: row.try_get("enabled")?,
            last_run_at: OptionalRfc3339DateTime::try_from(
                row.try_get::<Option<String>, _>("last_run_at")?,
            )?
            .into(),
            next_run_at: OptionalRfc3339DateTime::try_from(
                row.try_get::<Option<String>, _>("next_run_at")?,
            )?
            .into(),
            created_at: Rfc3339DateTime::try_from(row.try_get::<String, _>("created_at")?)?.into(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecurringCampaign {
    pub name: String,
    pub template_blocks: Vec<TemplateBlock>,
    pub subject: String,
    pub recipient_source: RecipientSource,
    pub cron_expr: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Fires due recurring campaigns as one-shot executor runs and rolls their
/// cron window forward. A failed run never disables the row.
#[derive(Clone)]
pub struct RecurringDispatcher {
    pool: SqlitePool,
    executor: CampaignExecutor,
}

impl RecurringDispatcher {
    pub fn new(pool: SqlitePool, executor: CampaignExecutor) -> Self {
        Self { pool, executor }
    }

    pub async fn insert(&self, new: NewRecurringCampaign) -> Result<i64, ScheduleError> {
        // A bad cron expression is rejected up front rather than at fire time.
        Schedule::from_str(&new.cron_expr)?;
        let next_run = next_fire(&new.cron_expr, &new.timezone, Utc::now())?;

        let result = sqlx::query(
            r#"
            INSERT INTO recurring_campaigns
                (name, template_blocks, subject, recipient_source, cron_expr, timezone,
                 cc, bcc, enabled, next_run_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)
            "#,
        )
        .bind(&new.name)
        .bind(serde_json::to_string(&new.template_blocks)?)
        .bind(&new.subject)
        .bind(serde_json::to_string(&new.recipient_source)?)
        .bind(&new.cron_expr)
        .bind(&new.timezone)
        .bind(serde_json::to_string(&new.cc)?)
        .bind(serde_json::to_string(&new.bcc)?)
        .bind(next_run.map(|dt| dt.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), ScheduleError> {
        sqlx::query("UPDATE recurring_campaigns SET enabled = ?1 WHERE id = ?2")
            .bind(if enabled { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Runs every enabled row whose `next_run_at` has passed. Returns how
    /// many rows fired.
    pub async fn dispatch_due(&self) -> Result<u64, ScheduleError> {
        let now = Utc::now();

        let due = sqlx::query_as::<_, RecurringCampaign>(
            r#"
            SELECT * FROM recurring_campaigns
            WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
            ORDER BY id ASC
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut fired = 0u64;

        for row in due {
            if let Err(e) = self.run_one(&row).await {
                error!(recurring_id = row.id, error = %e, "recurring run failed");
            }

            // The window rolls forward even after a failed run, so a broken
            // recipient source does not refire every minute.
            let next = match next_fire(&row.cron_expr, &row.timezone, now) {
                Ok(next) => next,
                Err(e) => {
                    error!(recurring_id = row.id, error = %e, "cannot compute next fire");
                    None
                }
            };

            sqlx::query(
                "UPDATE recurring_campaigns SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3",
            )
            .bind(now.to_rfc3339())
            .bind(next.map(|dt| dt.to_rfc3339()))
            .bind(row.id)
            .execute(&self.pool)
            .await?;

            fired += 1;
        }

        Ok(fired)
    }

    async fn run_one(&self, row: &RecurringCampaign) -> Result<(), ScheduleError> {
        let recipients = self.resolve_recipients(&row.recipient_source).await?;
        info!(
            recurring_id = row.id,
            recipients = recipients.len(),
            "firing recurring campaign"
        );

        let mut params = CampaignParams::new(
            row.name.clone(),
            row.template_blocks.clone(),
            row.subject.clone(),
            recipients,
        );
        params.cc = row.cc.clone();
        params.bcc = row.bcc.clone();

        // Nobody watches a cron-fired run; drain its events in the background.
        let mut rx = self.executor.run_campaign(params);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                debug!(?event, "recurring campaign progress");
            }
        });

        Ok(())
    }

    async fn resolve_recipients(
        &self,
        source: &RecipientSource,
    ) -> Result<Vec<Recipient>, ScheduleError> {
        match source {
            RecipientSource::Inline { recipients } => Ok(recipients.clone()),
            RecipientSource::CsvUrl { url } => {
                let body = reqwest::get(url).await?.text().await?;
                parse_csv_recipients(&body)
            }
            RecipientSource::JsonUrl { url } => {
                let values: Vec<serde_json::Value> = reqwest::get(url).await?.json().await?;
                Ok(parse_json_recipients(values))
            }
        }
    }
}

/// CSV with a header row; the `email` column (any case) addresses the
/// recipient and every other column becomes a template variable.
pub fn parse_csv_recipients(body: &str) -> Result<Vec<Recipient>, ScheduleError> {
    let mut reader = csv::Reader::from_reader(body.as_bytes());
    let headers = reader.headers()?.clone();

    let mut recipients = Vec::new();
    for record in reader.records() {
        let record = record?;

        let mut email = None;
        let mut data = HashMap::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            if header.eq_ignore_ascii_case("email") {
                email = Some(field.trim().to_string());
            } else {
                data.insert(header.to_string(), field.to_string());
            }
        }

        match email {
            Some(email) if !email.is_empty() => recipients.push(Recipient { email, data }),
            _ => warn!("skipping csv row without an email"),
        }
    }

    Ok(recipients)
}

/// JSON array of objects; `email` addresses the recipient, the remaining
/// fields become template variables.
pub fn parse_json_recipients(values: Vec<serde_json::Value>) -> Vec<Recipient> {
    let mut recipients = Vec::new();

    for value in values {
        let Some(object) = value.as_object() else {
            warn!("skipping non-object recipient entry");
            continue;
        };

        let Some(email) = object.get("email").and_then(|v| v.as_str()) else {
            warn!("skipping recipient entry without an email");
            continue;
        };

        let data = object
            .iter()
            .filter(|(key, _)| key.as_str() != "email")
            .map(|(key, value)| {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect();

        recipients.push(Recipient {
            email: email.to_string(),
            data,
        });
    }

    recipients
}

/// Next fire of `cron_expr` strictly after `after`, evaluated in the row's
/// timezone. Unknown timezone names fall back to UTC.
pub fn next_fire(
    cron_expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = Schedule::from_str(cron_expr)?;

    let tz: Tz = timezone.parse().unwrap_or_else(|_| {
        warn!(timezone, "unknown timezone, falling back to UTC");
        Tz::UTC
    });

    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc)))
}
