use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{info, warn};

use super::ScheduleError;
use crate::campaigns::executor::CampaignExecutor;
use crate::campaigns::types::{DeliveryOutcome, Recipient};
use crate::db::{OptionalRfc3339DateTime, Rfc3339DateTime};
use crate::templates::TemplateBlock;
use crate::tracking::TrackingOptions;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(EnrollmentStatus::Active),
            "completed" => Some(EnrollmentStatus::Completed),
            "cancelled" => Some(EnrollmentStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStep {
    pub id: i64,
    pub sequence_id: i64,
    pub step_order: i64,
    pub subject: String,
    pub template_blocks: Vec<TemplateBlock>,
    pub delay_days: i64,
    pub delay_hours: i64,
    /// Optional `HH:MM` wall-clock alignment for the computed send instant.
    pub send_time: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for SequenceStep {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(SequenceStep {
            id: row.try_get("id")?,
            sequence_id: row.try_get("sequence_id")?,
            step_order: row.try_get("step_order")?,
            subject: row.try_get("subject")?,
            template_blocks: serde_json::from_str(&row.try_get::<String, _>("template_blocks")?)
                .map_err(|e| sqlx::Error::Decode(format!("bad template_blocks json: {e}").into()))?,
            delay_days: row.try_get("delay_days")?,
            delay_hours: row.try_get("delay_hours")?,
            send_time: row.try_get("send_time")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceEnrollment {
    pub id: i64,
    pub sequence_id: i64,
    pub recipient_email: String,
    pub recipient_data: HashMap<String, String>,
    pub current_step: i64,
    pub status: EnrollmentStatus,
    pub next_send_at: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for SequenceEnrollment {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;

        Ok(SequenceEnrollment {
            id: row.try_get("id")?,
            sequence_id: row.try_get("sequence_id")?,
            recipient_email: row.try_get("recipient_email")?,
            recipient_data: serde_json::from_str(&row.try_get::<String, _>("recipient_data")?)
                .map_err(|e| sqlx::Error::Decode(format!("bad recipient_data json: {e}").into()))?,
            current_step: row.try_get("current_step")?,
            status: EnrollmentStatus::from_str(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown status: {status}").into()))?,
            next_send_at: OptionalRfc3339DateTime::try_from(
                row.try_get::<Option<String>, _>("next_send_at")?,
            )?
            .into(),
            enrolled_at: Rfc3339DateTime::try_from(row.try_get::<String, _>("enrolled_at")?)?
                .into(),
            completed_at: OptionalRfc3339DateTime::try_from(
                row.try_get::<Option<String>, _>("completed_at")?,
            )?
            .into(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSequenceStep {
    pub step_order: i64,
    pub subject: String,
    pub template_blocks: Vec<TemplateBlock>,
    #[serde(default)]
    pub delay_days: i64,
    #[serde(default)]
    pub delay_hours: i64,
    #[serde(default)]
    pub send_time: Option<String>,
}

/// Advances drip-sequence enrollments one step at a time. Sequence sends
/// scope their tracking tokens with `campaign_id = -sequence_id`.
#[derive(Clone)]
pub struct SequenceProcessor {
    pool: SqlitePool,
    executor: CampaignExecutor,
}

impl SequenceProcessor {
    pub fn new(pool: SqlitePool, executor: CampaignExecutor) -> Self {
        Self { pool, executor }
    }

    pub async fn insert_sequence(&self, name: &str) -> Result<i64, ScheduleError> {
        let result = sqlx::query("INSERT INTO sequences (name, enabled, created_at) VALUES (?1, 1, ?2)")
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn insert_step(
        &self,
        sequence_id: i64,
        step: NewSequenceStep,
    ) -> Result<i64, ScheduleError> {
        let result = sqlx::query(
            r#"
            INSERT INTO sequence_steps
                (sequence_id, step_order, subject, template_blocks, delay_days, delay_hours, send_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(sequence_id)
        .bind(step.step_order)
        .bind(&step.subject)
        .bind(serde_json::to_string(&step.template_blocks)?)
        .bind(step.delay_days)
        .bind(step.delay_hours)
        .bind(&step.send_time)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Enrolls a recipient at step 0, due immediately.
    pub async fn enroll(
        &self,
        sequence_id: i64,
        recipient: &Recipient,
    ) -> Result<i64, ScheduleError> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO sequence_enrollments
                (sequence_id, recipient_email, recipient_data, current_step, status, next_send_at, enrolled_at)
            VALUES (?1, ?2, ?3, 0, 'active', ?4, ?5)
            "#,
        )
        .bind(sequence_id)
        .bind(&recipient.email)
        .bind(serde_json::to_string(&recipient.data)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// One pass over due enrollments of enabled sequences. Returns how many
    /// enrollments were touched.
    pub async fn process_due(&self) -> Result<u64, ScheduleError> {
        let now = Utc::now();

        let due = sqlx::query_as::<_, SequenceEnrollment>(
            r#"
            SELECT e.* FROM sequence_enrollments e
            JOIN sequences s ON s.id = e.sequence_id
            WHERE e.status = 'active' AND s.enabled = 1
              AND e.next_send_at IS NOT NULL AND e.next_send_at <= ?1
            ORDER BY e.id ASC
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut touched = 0u64;

        for enrollment in due {
            let step = sqlx::query_as::<_, SequenceStep>(
                "SELECT * FROM sequence_steps WHERE sequence_id = ?1 AND step_order = ?2",
            )
            .bind(enrollment.sequence_id)
            .bind(enrollment.current_step)
            .fetch_optional(&self.pool)
            .await?;

            let Some(step) = step else {
                // Ran past the last configured step.
                self.complete(&enrollment).await?;
                touched += 1;
                continue;
            };

            let recipient = Recipient {
                email: enrollment.recipient_email.clone(),
                data: enrollment.recipient_data.clone(),
            };

            let outcome = self
                .executor
                .deliver_one(
                    -enrollment.sequence_id,
                    &recipient,
                    &step.subject,
                    &step.template_blocks,
                    &[],
                    &[],
                    TrackingOptions {
                        open: true,
                        click: true,
                    },
                )
                .await?;

            match outcome {
                DeliveryOutcome::NoAccount => {
                    // Leave the enrollment due; the next tick retries.
                    warn!(
                        enrollment_id = enrollment.id,
                        "no account available for sequence step"
                    );
                    continue;
                }
                DeliveryOutcome::Failed { message } => {
                    warn!(enrollment_id = enrollment.id, error = %message, "sequence step failed");
                }
                DeliveryOutcome::Sent { .. } => {}
            }

            let next_step = sqlx::query_as::<_, SequenceStep>(
                "SELECT * FROM sequence_steps WHERE sequence_id = ?1 AND step_order = ?2",
            )
            .bind(enrollment.sequence_id)
            .bind(enrollment.current_step + 1)
            .fetch_optional(&self.pool)
            .await?;

            match next_step {
                Some(next) => {
                    let next_send = calculate_next(&next, now);
                    sqlx::query(
                        "UPDATE sequence_enrollments SET current_step = current_step + 1, next_send_at = ?1 WHERE id = ?2",
                    )
                    .bind(next_send.to_rfc3339())
                    .bind(enrollment.id)
                    .execute(&self.pool)
                    .await?;
                }
                None => self.complete(&enrollment).await?,
            }

            touched += 1;
        }

        Ok(touched)
    }

    async fn complete(&self, enrollment: &SequenceEnrollment) -> Result<(), ScheduleError> {
        sqlx::query(
            "UPDATE sequence_enrollments SET status = 'completed', next_send_at = NULL, completed_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(enrollment.id)
        .execute(&self.pool)
        .await?;

        info!(enrollment_id = enrollment.id, "sequence enrollment completed");
        Ok(())
    }
}

/// Send instant for a step: now + delays, then aligned to the step's
/// `HH:MM` wall-clock time on the same calendar day when one is set.
pub fn calculate_next(step: &SequenceStep, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut next = now + Duration::days(step.delay_days) + Duration::hours(step.delay_hours);

    if let Some(ref send_time) = step.send_time {
        match parse_hhmm(send_time) {
            Some((hour, minute)) => {
                if let Some(aligned) = next.date_naive().and_hms_opt(hour, minute, 0) {
                    next = Utc.from_utc_datetime(&aligned);
                }
            }
            None => warn!(send_time, "ignoring malformed step send_time"),
        }
    }

    next
}

fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (hour, minute) = value.split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;

    if hour > 23 || minute > 59 {
        return None;
    }

    Some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(delay_days: i64, delay_hours: i64, send_time: Option<&str>) -> SequenceStep {
        SequenceStep {
            id: 1,
            sequence_id: 1,
            step_order: 1,
            subject: "s".into(),
            template_blocks: vec![],
            delay_days,
            delay_hours,
            send_time: send_time.map(String::from),
        }
    }

    #[test]
    fn delays_add_up_without_send_time() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let next = calculate_next(&step(2, 3, None), now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 3, 13, 0, 0).unwrap());
    }

    #[test]
    fn send_time_aligns_wall_clock_on_computed_day() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();

        // Delay lands on Jun 3 13:00; alignment pulls it to Jun 3 09:30.
        let next = calculate_next(&step(2, 3, Some("09:30")), now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap());

        // Alignment may also push later in the same day.
        let next = calculate_next(&step(2, 3, Some("18:45")), now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 3, 18, 45, 0).unwrap());
    }

    #[test]
    fn malformed_send_time_is_ignored() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        let next = calculate_next(&step(1, 0, Some("25:99")), now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 2, 10, 0, 0).unwrap());
    }

    #[test]
    fn hhmm_parsing_bounds() {
        assert_eq!(parse_hhmm("09:30"), Some((9, 30)));
        assert_eq!(parse_hhmm("23:59"), Some((23, 59)));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("aa:bb"), None);
        assert_eq!(parse_hhmm("0930"), None);
    }
}
