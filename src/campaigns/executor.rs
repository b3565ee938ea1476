use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::accounts::{AccountError, AccountManager, CircuitBreaker};
use crate::campaigns::logs::SendLogger;
use crate::campaigns::types::{
    CampaignParams, DeliveryOutcome, ProgressEvent, Recipient, SendStatus,
};
use crate::db::utc_tomorrow;
use crate::providers::{EmailMessage, ProviderFactory};
use crate::templates::{compile, substitute_vars, TemplateBlock};
use crate::tracking::{inject_tracking, TokenError, TokenService, TrackingOptions};

pub const QUEUED_MESSAGE: &str = "All accounts at cap";
const EVENT_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("account error: {0}")]
    Accounts(#[from] AccountError),
    #[error("token error: {0}")]
    Tokens(#[from] TokenError),
}

#[derive(Clone, Copy)]
enum Counter {
    Successful,
    Failed,
    Queued,
}

/// Composes account selection, compilation, tracking, provider dispatch and
/// bookkeeping into the per-recipient delivery step. One instance serves the
/// whole engine; independent campaign runs may execute in parallel.
#[derive(Clone)]
pub struct CampaignExecutor {
    pool: SqlitePool,
    accounts: AccountManager,
    breaker: Arc<CircuitBreaker>,
    tokens: TokenService,
    logs: SendLogger,
    factory: Arc<dyn ProviderFactory>,
    base_url: String,
    default_pace: Duration,
}

impl CampaignExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        accounts: AccountManager,
        breaker: Arc<CircuitBreaker>,
        tokens: TokenService,
        logs: SendLogger,
        factory: Arc<dyn ProviderFactory>,
        base_url: String,
        default_pace: Duration,
    ) -> Self {
        Self {
            pool,
            accounts,
            breaker,
            tokens,
            logs,
            factory,
            base_url,
            default_pace,
        }
    }

    pub fn logs(&self) -> &SendLogger {
        &self.logs
    }

    /// Starts the campaign and returns its progress stream. The run is
    /// spawned onto the runtime: dropping the receiver abandons the stream
    /// but the campaign still executes to completion.
    pub fn run_campaign(&self, params: CampaignParams) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run_inner(params, tx).await;
        });
        rx
    }

    async fn run_inner(self, params: CampaignParams, tx: mpsc::Sender<ProgressEvent>) {
        let run_id = Uuid::new_v4();
        let total = params.recipients.len();

        let campaign_id = match self.insert_campaign(&params).await {
            Ok(id) => id,
            Err(e) => {
                error!(%run_id, error = %e, "campaign setup failed");
                let _ = tx
                    .send(ProgressEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        info!(%run_id, campaign_id, total, name = %params.name, "campaign started");

        let pace = params.pace.unwrap_or(self.default_pace);
        let mut successful = 0i64;
        let mut failed = 0i64;
        let mut queued = 0i64;

        for (i, recipient) in params.recipients.iter().enumerate() {
            let current = i + 1;

            let message = match self
                .deliver_one(
                    campaign_id,
                    recipient,
                    &params.subject,
                    &params.template_blocks,
                    &params.cc,
                    &params.bcc,
                    params.tracking,
                )
                .await
            {
                Ok(DeliveryOutcome::Sent { account_name, .. }) => {
                    successful += 1;
                    self.bump(campaign_id, Counter::Successful).await;
                    format!("Sent to {} via {}", recipient.email, account_name)
                }
                Ok(DeliveryOutcome::Failed { message }) => {
                    failed += 1;
                    self.bump(campaign_id, Counter::Failed).await;
                    format!("Failed: {} - {}", recipient.email, message)
                }
                Ok(DeliveryOutcome::NoAccount) => {
                    if let Err(e) = self.enqueue(campaign_id, recipient).await {
                        error!(campaign_id, recipient = %recipient.email, error = %e, "failed to queue recipient");
                    }
                    if let Err(e) = self
                        .logs
                        .insert(
                            campaign_id,
                            None,
                            &recipient.email,
                            SendStatus::Queued,
                            Some(QUEUED_MESSAGE),
                            0,
                        )
                        .await
                    {
                        error!(campaign_id, error = %e, "failed to log queued recipient");
                    }
                    queued += 1;
                    self.bump(campaign_id, Counter::Queued).await;
                    format!("Queued {} for tomorrow", recipient.email)
                }
                Err(e) => {
                    // Bookkeeping failed mid-dispatch; count the recipient as
                    // failed so the totals still close.
                    warn!(campaign_id, recipient = %recipient.email, error = %e, "delivery bookkeeping error");
                    failed += 1;
                    self.bump(campaign_id, Counter::Failed).await;
                    format!("Failed: {} - {}", recipient.email, e)
                }
            };

            let _ = tx
                .send(ProgressEvent::Progress {
                    current,
                    total,
                    message,
                })
                .await;

            if current < total {
                tokio::time::sleep(pace).await;
            }
        }

        if let Err(e) = self.finalize(campaign_id, successful, failed, queued).await {
            error!(campaign_id, error = %e, "failed to finalize campaign");
            let _ = tx
                .send(ProgressEvent::Error {
                    message: e.to_string(),
                })
                .await;
            return;
        }

        info!(%run_id, campaign_id, successful, failed, queued, "campaign completed");
        let _ = tx
            .send(ProgressEvent::Complete {
                campaign_id,
                successful,
                failed,
                queued,
            })
            .await;
    }

    /// One delivery attempt: select an account, compile, track, send, record.
    /// Writes the success/failure send log itself; the no-account case writes
    /// nothing and leaves the decision to the caller.
    pub(crate) async fn deliver_one(
        &self,
        campaign_id: i64,
        recipient: &Recipient,
        subject: &str,
        blocks: &[TemplateBlock],
        cc: &[String],
        bcc: &[String],
        tracking: TrackingOptions,
    ) -> Result<DeliveryOutcome, CampaignError> {
        let Some(selected) = self.accounts.next_available(Some(campaign_id)).await? else {
            return Ok(DeliveryOutcome::NoAccount);
        };

        let account = selected.account;
        let mut html = compile(blocks, &recipient.data, &self.base_url);
        let subject = substitute_vars(subject, &recipient.data);

        if tracking.enabled() {
            let token = self
                .tokens
                .get_or_create(campaign_id, &recipient.email)
                .await?;
            html = inject_tracking(&html, &token, &self.base_url, tracking);
        }

        let provider = match self.factory.create(account.provider_kind, selected.config) {
            Ok(provider) => provider,
            Err(e) => {
                self.breaker.record_failure(account.id).await;
                self.logs
                    .insert(
                        campaign_id,
                        Some(account.id),
                        &recipient.email,
                        SendStatus::Failed,
                        Some(&e.to_string()),
                        0,
                    )
                    .await?;
                return Ok(DeliveryOutcome::Failed {
                    message: e.to_string(),
                });
            }
        };

        let message = EmailMessage {
            to: recipient.email.clone(),
            cc: cc.to_vec(),
            bcc: bcc.to_vec(),
            subject,
            html,
            attachments: Vec::new(),
        };

        let send_result = provider.send(&message).await;
        provider.close().await;

        match send_result {
            Ok(()) => {
                self.accounts.increment_send_count(account.id).await?;
                self.breaker.record_success(account.id).await;
                self.logs
                    .insert(
                        campaign_id,
                        Some(account.id),
                        &recipient.email,
                        SendStatus::Success,
                        None,
                        0,
                    )
                    .await?;
                Ok(DeliveryOutcome::Sent {
                    account_id: account.id,
                    account_name: account.name,
                })
            }
            Err(e) => {
                self.breaker.record_failure(account.id).await;
                self.logs
                    .insert(
                        campaign_id,
                        Some(account.id),
                        &recipient.email,
                        SendStatus::Failed,
                        Some(&e.to_string()),
                        0,
                    )
                    .await?;
                Ok(DeliveryOutcome::Failed {
                    message: e.to_string(),
                })
            }
        }
    }

    async fn insert_campaign(&self, params: &CampaignParams) -> Result<i64, CampaignError> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO campaigns
                (name, template_blocks, subject, total_recipients, successful, failed, queued,
                 status, cc, bcc, track_open, track_click, started_at, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, 0, 0, 'sending', ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&params.name)
        .bind(serde_json::to_string(&params.template_blocks)?)
        .bind(&params.subject)
        .bind(params.recipients.len() as i64)
        .bind(serde_json::to_string(&params.cc)?)
        .bind(serde_json::to_string(&params.bcc)?)
        .bind(if params.tracking.open { 1 } else { 0 })
        .bind(if params.tracking.click { 1 } else { 0 })
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn enqueue(&self, campaign_id: i64, recipient: &Recipient) -> Result<(), CampaignError> {
        sqlx::query(
            r#"
            INSERT INTO send_queue
                (campaign_id, recipient_email, recipient_data, scheduled_for, status, created_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
            "#,
        )
        .bind(campaign_id)
        .bind(&recipient.email)
        .bind(serde_json::to_string(&recipient.data)?)
        .bind(utc_tomorrow())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn bump(&self, campaign_id: i64, counter: Counter) {
        let sql = match counter {
            Counter::Successful => "UPDATE campaigns SET successful = successful + 1 WHERE id = ?1",
            Counter::Failed => "UPDATE campaigns SET failed = failed + 1 WHERE id = ?1",
            Counter::Queued => "UPDATE campaigns SET queued = queued + 1 WHERE id = ?1",
        };

        if let Err(e) = sqlx::query(sql).bind(campaign_id).execute(&self.pool).await {
            error!(campaign_id, error = %e, "failed to bump campaign counter");
        }
    }

    async fn finalize(
        &self,
        campaign_id: i64,
        successful: i64,
        failed: i64,
        queued: i64,
    ) -> Result<(), CampaignError> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET successful = ?1, failed = ?2, queued = ?3, status = 'completed', completed_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(successful)
        .bind(failed)
        .bind(queued)
        .bind(Utc::now().to_rfc3339())
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
