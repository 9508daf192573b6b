//! In-memory service registry backed by a broadcast channel.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;

use super::{ServiceEvent, ServiceRegistry};
use crate::domain::{ServiceKey, ServiceRecord};
use crate::errors::Result;

const EVENT_BUFFER: usize = 256;

#[derive(Debug)]
pub struct InMemoryServiceRegistry {
    services: RwLock<BTreeMap<ServiceKey, ServiceRecord>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Default for InMemoryServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServiceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { services: RwLock::new(BTreeMap::new()), events }
    }

    /// Create or replace a Service and notify watchers.
    pub async fn apply(&self, record: ServiceRecord) {
        self.services.write().await.insert(record.key(), record.clone());
        // No receivers is fine.
        let _ = self.events.send(ServiceEvent::Applied(record));
    }

    /// Remove a Service and notify watchers.
    pub async fn delete(&self, namespace: &str, name: &str) -> Option<ServiceRecord> {
        let removed = self.services.write().await.remove(&ServiceKey::new(namespace, name));
        if let Some(record) = &removed {
            let _ = self.events.send(ServiceEvent::Deleted(record.clone()));
        }
        removed
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryServiceRegistry {
    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.services.read().await.values().cloned().collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.services.read().await.get(&ServiceKey::new(namespace, name)).cloned())
    }

    fn watch(&self) -> BoxStream<'static, ServiceEvent> {
        // Lagged receivers drop events; resync picks them up.
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }
}
