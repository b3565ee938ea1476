use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

pub const FAILURE_THRESHOLD: u32 = 5;
pub const COOLDOWN_SECS: i64 = 5 * 60;

#[derive(Debug, Default)]
struct BreakerState {
    hydrated: bool,
    failures: u32,
    last_failure: Option<DateTime<Utc>>,
    open_until: Option<DateTime<Utc>>,
}

/// Per-account failure counter with a persisted cooldown. Failure counts are
/// in-memory only; `open_until` survives restarts via the account row, so a
/// restart forgives failures but not an active cooldown.
pub struct CircuitBreaker {
    pool: SqlitePool,
    cooldown: Duration,
    entries: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<BreakerState>>>>,
}

impl CircuitBreaker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cooldown: Duration::seconds(COOLDOWN_SECS),
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_cooldown(pool: SqlitePool, cooldown: Duration) -> Self {
        Self {
            pool,
            cooldown,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, account_id: i64) -> Arc<tokio::sync::Mutex<BreakerState>> {
        let mut guard = self.entries.lock();
        guard.entry(account_id).or_default().clone()
    }

    async fn hydrate(&self, account_id: i64, state: &mut BreakerState) {
        if state.hydrated {
            return;
        }
        state.hydrated = true;

        let persisted = sqlx::query_scalar::<_, Option<String>>(
            "SELECT circuit_breaker_until FROM sender_accounts WHERE id = ?1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await;

        match persisted {
            Ok(Some(Some(raw))) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(until) if until.with_timezone(&Utc) > Utc::now() => {
                    state.open_until = Some(until.with_timezone(&Utc));
                }
                Ok(_) => {}
                Err(e) => warn!(account_id, error = %e, "unparseable circuit_breaker_until"),
            },
            Ok(_) => {}
            Err(e) => warn!(account_id, error = %e, "failed to hydrate circuit breaker"),
        }
    }

    pub async fn is_open(&self, account_id: i64) -> bool {
        let entry = self.entry(account_id);
        let mut state = entry.lock().await;
        self.hydrate(account_id, &mut state).await;

        match state.open_until {
            Some(until) if until <= Utc::now() => {
                state.open_until = None;
                state.failures = 0;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub async fn record_success(&self, account_id: i64) {
        let entry = self.entry(account_id);
        let mut state = entry.lock().await;
        self.hydrate(account_id, &mut state).await;

        state.failures = 0;
        state.last_failure = None;

        if state.open_until.take().is_some() {
            self.persist(account_id, None).await;
        }
    }

    pub async fn record_failure(&self, account_id: i64) {
        let entry = self.entry(account_id);
        let mut state = entry.lock().await;
        self.hydrate(account_id, &mut state).await;

        state.failures += 1;
        state.last_failure = Some(Utc::now());

        if state.failures >= FAILURE_THRESHOLD && state.open_until.is_none() {
            let until = Utc::now() + self.cooldown;
            state.open_until = Some(until);
            warn!(
                account_id,
                failures = state.failures,
                open_until = %until,
                "circuit breaker opened"
            );
            // The in-memory breaker stays open even if the write fails.
            self.persist(account_id, Some(until)).await;
        }
    }

    /// Accounts whose breaker is currently open, whether tripped in this
    /// process or persisted by a previous one.
    pub async fn open_circuits(&self) -> Vec<i64> {
        let now = Utc::now();
        let mut open = Vec::new();

        let entries: Vec<(i64, Arc<tokio::sync::Mutex<BreakerState>>)> = {
            let guard = self.entries.lock();
            guard.iter().map(|(id, e)| (*id, e.clone())).collect()
        };
        for (account_id, entry) in entries {
            let state = entry.lock().await;
            if matches!(state.open_until, Some(until) if until > now) {
                open.push(account_id);
            }
        }

        let persisted = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM sender_accounts WHERE circuit_breaker_until > ?1",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await;

        match persisted {
            Ok(ids) => {
                for id in ids {
                    if !open.contains(&id) && self.is_open(id).await {
                        open.push(id);
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to enumerate persisted circuits"),
        }

        open.sort_unstable();
        open
    }

    async fn persist(&self, account_id: i64, until: Option<DateTime<Utc>>) {
        let result =
            sqlx::query("UPDATE sender_accounts SET circuit_breaker_until = ?1 WHERE id = ?2")
                .bind(until.map(|dt| dt.to_rfc3339()))
                .bind(account_id)
                .execute(&self.pool)
                .await;

        if let Err(e) = result {
            error!(account_id, error = %e, "failed to persist circuit breaker state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;

    async fn pool_with_account(id: i64) -> SqlitePool {
        let pool = crate::db::create_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        sqlx::query(
            r#"
            INSERT INTO sender_accounts
                (id, name, provider_kind, encrypted_config, daily_cap, campaign_cap, priority, enabled, created_at)
            VALUES (?1, 'test', 'smtp', '{}', 100, 100, 0, 1, ?2)
            "#,
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let pool = pool_with_account(1).await;
        let breaker = CircuitBreaker::new(pool.clone());

        for _ in 0..FAILURE_THRESHOLD - 1 {
            breaker.record_failure(1).await;
            assert!(!breaker.is_open(1).await);
        }

        breaker.record_failure(1).await;
        assert!(breaker.is_open(1).await);

        let persisted = sqlx::query_scalar::<_, Option<String>>(
            "SELECT circuit_breaker_until FROM sender_accounts WHERE id = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(persisted.is_some());
    }

    #[tokio::test]
    async fn success_resets_failures_and_closes() {
        let pool = pool_with_account(1).await;
        let breaker = CircuitBreaker::new(pool.clone());

        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure(1).await;
        }
        assert!(breaker.is_open(1).await);

        breaker.record_success(1).await;
        assert!(!breaker.is_open(1).await);

        let persisted = sqlx::query_scalar::<_, Option<String>>(
            "SELECT circuit_breaker_until FROM sender_accounts WHERE id = 1",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(persisted.is_none());

        // Counter was reset: a few more failures do not immediately reopen.
        breaker.record_failure(1).await;
        breaker.record_failure(1).await;
        assert!(!breaker.is_open(1).await);
    }

    #[tokio::test]
    async fn cooldown_expiry_closes_lazily() {
        let pool = pool_with_account(1).await;
        let breaker = CircuitBreaker::with_cooldown(pool, Duration::milliseconds(-1));

        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure(1).await;
        }

        // Already expired: the first query observes a closed breaker.
        assert!(!breaker.is_open(1).await);
    }

    #[tokio::test]
    async fn cooldown_survives_restart_via_account_row() {
        let pool = pool_with_account(1).await;

        {
            let breaker = CircuitBreaker::new(pool.clone());
            for _ in 0..FAILURE_THRESHOLD {
                breaker.record_failure(1).await;
            }
            assert!(breaker.is_open(1).await);
        }

        // Fresh breaker, same database: hydration resumes the cooldown.
        let restarted = CircuitBreaker::new(pool);
        assert!(restarted.is_open(1).await);
        assert_eq!(restarted.open_circuits().await, vec![1]);
    }

    #[tokio::test]
    async fn distinct_accounts_do_not_interfere() {
        let pool = pool_with_account(1).await;
        sqlx::query(
            r#"
            INSERT INTO sender_accounts
                (id, name, provider_kind, encrypted_config, daily_cap, campaign_cap, priority, enabled, created_at)
            VALUES (2, 'other', 'smtp', '{}', 100, 100, 0, 1, ?1)
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let breaker = CircuitBreaker::new(pool);
        for _ in 0..FAILURE_THRESHOLD {
            breaker.record_failure(1).await;
        }

        assert!(breaker.is_open(1).await);
        assert!(!breaker.is_open(2).await);
        assert_eq!(breaker.open_circuits().await, vec![1]);
    }
}
