use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::accounts::{AccountManager, CircuitBreaker};
use crate::campaigns::{
    Campaign, CampaignExecutor, CampaignParams, ProgressEvent, QueueProcessor, SendLogger,
};
use crate::config::{ConfigError, EngineConfig};
use crate::db;
use crate::providers::{LettreProviderFactory, ProviderFactory};
use crate::scheduler::{
    RecurringDispatcher, Scheduler, ScheduledDispatcher, SchedulerHandle, SequenceProcessor,
};
use crate::tracking::TokenService;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// The delivery engine context: one database pool and one instance of each
/// subsystem, wired together. Everything the engine does is reachable from
/// here; nothing lives in process globals.
pub struct Engine {
    pool: SqlitePool,
    pub accounts: AccountManager,
    pub breaker: Arc<CircuitBreaker>,
    pub tokens: TokenService,
    pub logs: SendLogger,
    pub executor: CampaignExecutor,
    pub queue: QueueProcessor,
    pub scheduled: ScheduledDispatcher,
    pub recurring: RecurringDispatcher,
    pub sequences: SequenceProcessor,
}

impl Engine {
    /// Opens the configured database and assembles the engine around the
    /// real lettre-backed providers.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_factory(config, Arc::new(LettreProviderFactory)).await
    }

    pub async fn with_factory(
        config: EngineConfig,
        factory: Arc<dyn ProviderFactory>,
    ) -> Result<Self, EngineError> {
        let pool = db::create_pool(&config.database_path).await?;
        db::init_schema(&pool).await?;
        Ok(Self::assemble(pool, config, factory))
    }

    /// Wires the subsystems over an already-initialized pool. Used by tests
    /// and embedders that manage their own database.
    pub fn assemble(
        pool: SqlitePool,
        config: EngineConfig,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(pool.clone()));
        let master_key = Arc::new(config.master_key);
        let accounts = AccountManager::new(pool.clone(), breaker.clone(), master_key);
        let tokens = TokenService::new(pool.clone());
        let logs = SendLogger::new(pool.clone());

        let executor = CampaignExecutor::new(
            pool.clone(),
            accounts.clone(),
            breaker.clone(),
            tokens.clone(),
            logs.clone(),
            factory,
            config.base_url,
            config.pace,
        );

        let queue = QueueProcessor::new(pool.clone(), executor.clone());
        let scheduled = ScheduledDispatcher::new(pool.clone());
        let recurring = RecurringDispatcher::new(pool.clone(), executor.clone());
        let sequences = SequenceProcessor::new(pool.clone(), executor.clone());

        Self {
            pool,
            accounts,
            breaker,
            tokens,
            logs,
            executor,
            queue,
            scheduled,
            recurring,
            sequences,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn run_campaign(&self, params: CampaignParams) -> mpsc::Receiver<ProgressEvent> {
        self.executor.run_campaign(params)
    }

    /// Campaigns a previous process left in `sending`. Reported, never
    /// auto-restarted; their send logs say how far each one got.
    pub async fn interrupted_campaigns(&self) -> Result<Vec<Campaign>, sqlx::Error> {
        let interrupted =
            sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE status = 'sending'")
                .fetch_all(&self.pool)
                .await?;

        for campaign in &interrupted {
            warn!(
                campaign_id = campaign.id,
                name = %campaign.name,
                successful = campaign.successful,
                failed = campaign.failed,
                queued = campaign.queued,
                total = campaign.total_recipients,
                "campaign was interrupted"
            );
        }

        Ok(interrupted)
    }

    /// Spawns the cron loop over this engine's processors.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        Scheduler::new(
            self.scheduled.clone(),
            self.recurring.clone(),
            self.sequences.clone(),
            self.queue.clone(),
        )
        .start()
    }
}
