#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mailblast::{
    create_pool, init_schema, Campaign, EmailMessage, Engine, EngineConfig, NewSenderAccount,
    Provider, ProviderConfig, ProviderError, ProviderFactory, ProviderKind, QueueEntry, SendLog,
};

pub const MASTER_KEY: &[u8] = b"integration-test-master-key";
pub const BASE_URL: &str = "https://mail.example.com";

/// Scripted stand-in for a live SMTP transport. Accounts whose username is
/// listed in `failing_users` reject every send.
pub struct MockProvider {
    fail: bool,
    username: String,
    sent: Arc<Mutex<Vec<(String, EmailMessage)>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Provider for MockProvider {
    async fn send(&self, message: &EmailMessage) -> Result<(), ProviderError> {
        if self.fail {
            return Err(ProviderError::Delivery("smtp 550 rejected".into()));
        }
        self.sent.lock().push((self.username.clone(), message.clone()));
        Ok(())
    }

    async fn verify(&self) -> Result<bool, ProviderError> {
        Ok(!self.fail)
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub failing_users: Vec<String>,
    pub sent: Arc<Mutex<Vec<(String, EmailMessage)>>>,
    pub created: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn sent_messages(&self) -> Vec<(String, EmailMessage)> {
        self.sent.lock().clone()
    }
}

impl ProviderFactory for MockFactory {
    fn create(
        &self,
        _kind: ProviderKind,
        config: ProviderConfig,
    ) -> Result<Box<dyn Provider>, ProviderError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockProvider {
            fail: self.failing_users.contains(&config.username),
            username: config.username,
            sent: self.sent.clone(),
            closed: self.closed.clone(),
        }))
    }
}

/// Engine over a scratch file database with zero pace delay. The returned
/// TempDir must stay alive for the duration of the test.
pub async fn test_engine(factory: Arc<dyn ProviderFactory>) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("engine.db");

    let pool = create_pool(&db_path).await.expect("pool");
    init_schema(&pool).await.expect("schema");

    let config =
        EngineConfig::new(db_path, BASE_URL, MASTER_KEY).with_pace(Duration::from_millis(0));

    (Engine::assemble(pool, config, factory), dir)
}

pub fn provider_config(username: &str) -> ProviderConfig {
    ProviderConfig {
        host: Some("smtp.example.com".into()),
        port: Some(587),
        username: username.into(),
        password: "app-password".into(),
        from_address: username.into(),
        from_name: Some("Test Sender".into()),
        use_tls: false,
        use_starttls: true,
    }
}

pub fn account(name: &str, daily_cap: i64, campaign_cap: i64, priority: i64) -> NewSenderAccount {
    NewSenderAccount {
        name: name.into(),
        provider_kind: ProviderKind::Smtp,
        config: provider_config(&format!("{name}@example.com")),
        daily_cap,
        campaign_cap,
        priority,
    }
}

pub async fn campaign_by_id(engine: &Engine, id: i64) -> Campaign {
    sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?1")
        .bind(id)
        .fetch_one(engine.pool())
        .await
        .expect("campaign row")
}

pub async fn send_logs(engine: &Engine, campaign_id: i64) -> Vec<SendLog> {
    engine
        .logs
        .logs_for_campaign(campaign_id, 1000)
        .await
        .expect("send logs")
}

pub async fn queue_entries(engine: &Engine, campaign_id: i64) -> Vec<QueueEntry> {
    sqlx::query_as::<_, QueueEntry>(
        "SELECT * FROM send_queue WHERE campaign_id = ?1 ORDER BY id ASC",
    )
    .bind(campaign_id)
    .fetch_all(engine.pool())
    .await
    .expect("queue entries")
}

pub async fn send_count_today(engine: &Engine, account_id: i64) -> i64 {
    engine
        .accounts
        .today_count(account_id)
        .await
        .expect("today count")
}

pub async fn collect_events(
    mut rx: tokio::sync::mpsc::Receiver<mailblast::ProgressEvent>,
) -> Vec<mailblast::ProgressEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}
