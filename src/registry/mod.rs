//! # Service registry
//!
//! Source of Service observations for the serving-cert controller: a
//! point-in-time list, single lookups, and a stream of change events.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::ServiceRecord;
use crate::errors::Result;

pub mod memory;

#[cfg(feature = "kubernetes")]
pub mod kube;

pub use memory::InMemoryServiceRegistry;

#[cfg(feature = "kubernetes")]
pub use self::kube::KubeServiceRegistry;

/// Change notification for a Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Created or updated
    Applied(ServiceRecord),
    Deleted(ServiceRecord),
}

impl ServiceEvent {
    pub fn record(&self) -> &ServiceRecord {
        match self {
            Self::Applied(record) | Self::Deleted(record) => record,
        }
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// All Services currently known, across namespaces.
    async fn list_services(&self) -> Result<Vec<ServiceRecord>>;

    /// Current state of one Service. `Ok(None)` when it does not exist.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceRecord>>;

    /// Change events from now on. Delivery is best-effort; the controller's
    /// periodic resync covers anything missed.
    fn watch(&self) -> BoxStream<'static, ServiceEvent>;
}
