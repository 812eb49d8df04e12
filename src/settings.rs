//! Live provider settings with change subscription.
//!
//! Settings are persisted as one JSON document. API keys are not part of the
//! document; they are carried over from the environment-derived defaults.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::config::AuleConfig;
use crate::error::DatabaseError;
use crate::llm::{ImageConfig, LlmConfig};
use crate::store::Database;

/// Settings key of the provider document.
pub const PROVIDER_SETTINGS_KEY: &str = "providers";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub llm: LlmConfig,
    pub image: ImageConfig,
}

impl ProviderSettings {
    pub fn from_config(config: &AuleConfig) -> Self {
        Self {
            llm: config.llm.clone(),
            image: config.image.clone(),
        }
    }

    /// Fill in API keys missing from `self` with the ones in `other`.
    fn inherit_keys(mut self, other: &ProviderSettings) -> Self {
        if self.llm.api_key.is_none() {
            self.llm.api_key = other.llm.api_key.clone();
        }
        if self.image.api_key.is_none() {
            self.image.api_key = other.image.api_key.clone();
        }
        self
    }
}

pub struct SettingsStore {
    db: Arc<dyn Database>,
    tx: watch::Sender<ProviderSettings>,
}

impl SettingsStore {
    /// Load persisted settings, or seed them from `defaults` on first run.
    pub async fn load(
        db: Arc<dyn Database>,
        defaults: ProviderSettings,
    ) -> Result<Self, DatabaseError> {
        let settings = match db.get_setting(PROVIDER_SETTINGS_KEY).await? {
            Some(value) => serde_json::from_value::<ProviderSettings>(value)
                .map_err(|e| DatabaseError::Serialization(format!("provider settings: {e}")))?
                .inherit_keys(&defaults),
            None => {
                db.set_setting(PROVIDER_SETTINGS_KEY, &to_value(&defaults)?)
                    .await?;
                defaults
            }
        };
        let (tx, _rx) = watch::channel(settings);
        Ok(Self { db, tx })
    }

    pub fn current(&self) -> ProviderSettings {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every [`SettingsStore::update`].
    pub fn subscribe(&self) -> watch::Receiver<ProviderSettings> {
        self.tx.subscribe()
    }

    /// Persist new settings, then notify subscribers.
    pub async fn update(&self, settings: ProviderSettings) -> Result<(), DatabaseError> {
        let settings = settings.inherit_keys(&self.current());
        self.db
            .set_setting(PROVIDER_SETTINGS_KEY, &to_value(&settings)?)
            .await?;
        info!(
            llm_backend = %settings.llm.backend,
            llm_model = %settings.llm.model,
            image_backend = %settings.image.backend,
            "Provider settings updated"
        );
        self.tx.send_replace(settings);
        Ok(())
    }
}

fn to_value(settings: &ProviderSettings) -> Result<serde_json::Value, DatabaseError> {
    serde_json::to_value(settings).map_err(|e| DatabaseError::Serialization(e.to_string()))
}
