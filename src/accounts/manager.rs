use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroizing;

use crate::accounts::breaker::CircuitBreaker;
use crate::accounts::crypto::{self, CryptoError};
use crate::accounts::types::{NewSenderAccount, SenderAccount};
use crate::db::utc_today;
use crate::providers::{ProviderConfig, ProviderError, ProviderFactory};

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("config crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("account not found: {0}")]
    NotFound(i64),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// An account chosen for a send, with its provider config already unsealed.
pub struct SelectedAccount {
    pub account: SenderAccount,
    pub config: ProviderConfig,
}

/// Chooses sender accounts and maintains per-day send tallies. The
/// select-then-send window is deliberately unlocked: `today_count` is a
/// point-in-time read, so parallel campaigns can overshoot `daily_cap` by at
/// most one send each.
#[derive(Clone)]
pub struct AccountManager {
    pool: SqlitePool,
    breaker: Arc<CircuitBreaker>,
    master_key: Arc<Zeroizing<Vec<u8>>>,
}

impl AccountManager {
    pub fn new(
        pool: SqlitePool,
        breaker: Arc<CircuitBreaker>,
        master_key: Arc<Zeroizing<Vec<u8>>>,
    ) -> Self {
        Self {
            pool,
            breaker,
            master_key,
        }
    }

    /// The highest-priority account that is enabled, not cooling down, under
    /// its daily cap, and (when `campaign_id` is given) under its per-campaign
    /// cap. Ties break on id, so selection is stable for identical state.
    pub async fn next_available(
        &self,
        campaign_id: Option<i64>,
    ) -> Result<Option<SelectedAccount>, AccountError> {
        let accounts = sqlx::query_as::<_, SenderAccount>(
            "SELECT * FROM sender_accounts WHERE enabled = 1 ORDER BY priority ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let today = utc_today();

        for account in accounts {
            if self.breaker.is_open(account.id).await {
                continue;
            }

            if self.count_for_date(account.id, &today).await? >= account.daily_cap {
                continue;
            }

            if let Some(campaign_id) = campaign_id {
                let used = self.campaign_send_count(campaign_id, account.id).await?;
                if used >= account.campaign_cap {
                    continue;
                }
            }

            match crypto::open_config::<ProviderConfig>(&self.master_key, &account.encrypted_config)
            {
                Ok(config) => return Ok(Some(SelectedAccount { account, config })),
                Err(e) => {
                    warn!(account_id = account.id, error = %e, "skipping account with undecryptable config");
                    continue;
                }
            }
        }

        Ok(None)
    }

    /// Upsert-increment of today's tally. Sole writer of `send_counts` rows.
    pub async fn increment_send_count(&self, account_id: i64) -> Result<(), AccountError> {
        sqlx::query(
            r#"
            INSERT INTO send_counts (account_id, date, count)
            VALUES (?1, ?2, 1)
            ON CONFLICT(account_id, date) DO UPDATE SET count = count + 1
            "#,
        )
        .bind(account_id)
        .bind(utc_today())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn today_count(&self, account_id: i64) -> Result<i64, AccountError> {
        self.count_for_date(account_id, &utc_today()).await
    }

    async fn count_for_date(&self, account_id: i64, date: &str) -> Result<i64, AccountError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM send_counts WHERE account_id = ?1 AND date = ?2",
        )
        .bind(account_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.unwrap_or(0))
    }

    /// Delivery attempts already logged for this (campaign, account) pair.
    pub async fn campaign_send_count(
        &self,
        campaign_id: i64,
        account_id: i64,
    ) -> Result<i64, AccountError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM send_logs WHERE campaign_id = ?1 AND account_id = ?2",
        )
        .bind(campaign_id)
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn insert_account(&self, new: NewSenderAccount) -> Result<i64, AccountError> {
        let sealed = crypto::seal_config(&self.master_key, &new.config)?;

        let result = sqlx::query(
            r#"
            INSERT INTO sender_accounts
                (name, provider_kind, encrypted_config, daily_cap, campaign_cap, priority, enabled, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
            "#,
        )
        .bind(&new.name)
        .bind(new.provider_kind.as_str())
        .bind(&sealed)
        .bind(new.daily_cap)
        .bind(new.campaign_cap)
        .bind(new.priority)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_account(&self, id: i64) -> Result<SenderAccount, AccountError> {
        sqlx::query_as::<_, SenderAccount>("SELECT * FROM sender_accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AccountError::NotFound(id))
    }

    pub async fn list_accounts(&self) -> Result<Vec<SenderAccount>, AccountError> {
        Ok(sqlx::query_as::<_, SenderAccount>(
            "SELECT * FROM sender_accounts ORDER BY priority ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), AccountError> {
        let result = sqlx::query("UPDATE sender_accounts SET enabled = ?1 WHERE id = ?2")
            .bind(if enabled { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AccountError::NotFound(id));
        }

        Ok(())
    }

    /// Unseals the account config and asks its provider to check the
    /// transport connection.
    pub async fn verify_account(
        &self,
        id: i64,
        factory: &dyn ProviderFactory,
    ) -> Result<bool, AccountError> {
        let account = self.get_account(id).await?;
        let config =
            crypto::open_config::<ProviderConfig>(&self.master_key, &account.encrypted_config)?;

        let provider = factory.create(account.provider_kind, config)?;
        let outcome = provider.verify().await;
        provider.close().await;

        Ok(outcome?)
    }
}
