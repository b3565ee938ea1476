use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::db::{OptionalRfc3339DateTime, Rfc3339DateTime};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Smtp,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
            ProviderKind::Smtp => "smtp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "gmail" => Some(ProviderKind::Gmail),
            "smtp" => Some(ProviderKind::Smtp),
            _ => None,
        }
    }
}

/// A configured outbound channel. `encrypted_config` stays sealed until an
/// account is selected for a send; `Debug` never shows it.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderAccount {
    pub id: i64,
    pub name: String,
    pub provider_kind: ProviderKind,
    #[serde(skip_serializing)]
    pub encrypted_config: String,
    pub daily_cap: i64,
    pub campaign_cap: i64,
    pub priority: i64,
    pub enabled: bool,
    pub circuit_breaker_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for SenderAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderAccount")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("provider_kind", &self.provider_kind)
            .field("encrypted_config", &"<redacted>")
            .field("daily_cap", &self.daily_cap)
            .field("campaign_cap", &self.campaign_cap)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("circuit_breaker_until", &self.circuit_breaker_until)
            .finish()
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for SenderAccount {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("provider_kind")?;

        Ok(SenderAccount {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            provider_kind: ProviderKind::from_str(&kind).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown provider kind: {kind}").into())
            })?,
            encrypted_config: row.try_get("encrypted_config")?,
            daily_cap: row.try_get("daily_cap")?,
            campaign_cap: row.try_get("campaign_cap")?,
            priority: row.try_get("priority")?,
            enabled: row.try_get("enabled")?,
            circuit_breaker_until: OptionalRfc3339DateTime::try_from(
                row.try_get::<Option<String>, _>("circuit_breaker_until")?,
            )?
            .into(),
            created_at: Rfc3339DateTime::try_from(row.try_get::<String, _>("created_at")?)?.into(),
        })
    }
}

/// Input for registering an account; the provider config arrives in the
/// clear and is sealed before it touches the database.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSenderAccount {
    pub name: String,
    pub provider_kind: ProviderKind,
    pub config: crate::providers::ProviderConfig,
    pub daily_cap: i64,
    pub campaign_cap: i64,
    #[serde(default)]
    pub priority: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_roundtrip() {
        assert_eq!(ProviderKind::Gmail.as_str(), "gmail");
        assert_eq!(ProviderKind::from_str("smtp"), Some(ProviderKind::Smtp));
        assert_eq!(ProviderKind::from_str("ses"), None);
    }

    #[test]
    fn debug_never_exposes_config() {
        let account = SenderAccount {
            id: 1,
            name: "primary".into(),
            provider_kind: ProviderKind::Smtp,
            encrypted_config: "sealed-bytes".into(),
            daily_cap: 100,
            campaign_cap: 10,
            priority: 0,
            enabled: true,
            circuit_breaker_until: None,
            created_at: Utc::now(),
        };

        let rendered = format!("{:?}", account);
        assert!(!rendered.contains("sealed-bytes"));
        assert!(rendered.contains("<redacted>"));
    }
}
