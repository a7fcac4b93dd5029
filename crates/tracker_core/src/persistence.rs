use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::protocol::{PersistedDeliveries, ACTIVE_DELIVERIES_KEY};
use storage::Storage;
use tokio::sync::Mutex;

/// Durable home of the active delivery set between sessions.
#[async_trait]
pub trait DeliveryPersistence: Send + Sync {
    async fn save(&self, blob: &PersistedDeliveries) -> Result<()>;
    async fn load(&self) -> Result<Option<PersistedDeliveries>>;
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl DeliveryPersistence for Storage {
    async fn save(&self, blob: &PersistedDeliveries) -> Result<()> {
        let encoded = serde_json::to_string(blob).context("failed to encode active deliveries")?;
        self.set_item(ACTIVE_DELIVERIES_KEY, &encoded).await
    }

    async fn load(&self) -> Result<Option<PersistedDeliveries>> {
        let Some(raw) = self.get_item(ACTIVE_DELIVERIES_KEY).await? else {
            return Ok(None);
        };
        decode(&raw).map(Some)
    }

    async fn clear(&self) -> Result<()> {
        self.remove_item(ACTIVE_DELIVERIES_KEY).await?;
        Ok(())
    }
}

/// Process-local persistence; nothing survives a restart.
#[derive(Default)]
pub struct MemoryPersistence {
    slot: Mutex<Option<String>>,
}

impl MemoryPersistence {
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            slot: Mutex::new(Some(raw.into())),
        }
    }

    /// The JSON currently held, as it would sit in local storage.
    pub async fn raw(&self) -> Option<String> {
        self.slot.lock().await.clone()
    }
}

#[async_trait]
impl DeliveryPersistence for MemoryPersistence {
    async fn save(&self, blob: &PersistedDeliveries) -> Result<()> {
        let encoded = serde_json::to_string(blob).context("failed to encode active deliveries")?;
        *self.slot.lock().await = Some(encoded);
        Ok(())
    }

    async fn load(&self) -> Result<Option<PersistedDeliveries>> {
        match self.slot.lock().await.as_deref() {
            Some(raw) => decode(raw).map(Some),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

fn decode(raw: &str) -> Result<PersistedDeliveries> {
    serde_json::from_str(raw)
        .with_context(|| format!("corrupt '{ACTIVE_DELIVERIES_KEY}' blob in local storage"))
}
