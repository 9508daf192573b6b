//! Service registry backed by the Kubernetes API server.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::warn;

use super::{ServiceEvent, ServiceRegistry};
use crate::domain::ServiceRecord;
use crate::errors::Result;
use crate::storage::kube::map_kube_error;

pub struct KubeServiceRegistry {
    client: Client,
}

impl KubeServiceRegistry {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn to_record(service: Service) -> ServiceRecord {
    let metadata = service.metadata;
    ServiceRecord {
        namespace: metadata.namespace.unwrap_or_default(),
        name: metadata.name.unwrap_or_default(),
        uid: metadata.uid.unwrap_or_default(),
        annotations: metadata.annotations.unwrap_or_default(),
    }
}

#[async_trait]
impl ServiceRegistry for KubeServiceRegistry {
    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let api: Api<Service> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, "services"))?;
        Ok(list.items.into_iter().map(to_record).collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<ServiceRecord>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map(|service| service.map(to_record))
            .map_err(|e| map_kube_error(e, &format!("{}/{}", namespace, name)))
    }

    fn watch(&self) -> BoxStream<'static, ServiceEvent> {
        let api: Api<Service> = Api::all(self.client.clone());
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(service)) | Ok(watcher::Event::InitApply(service)) => {
                        Some(ServiceEvent::Applied(to_record(service)))
                    }
                    Ok(watcher::Event::Delete(service)) => Some(ServiceEvent::Deleted(to_record(service))),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => {
                        // Errors are surfaced once each; `default_backoff` delays the re-poll.
                        warn!(error = %e, "Service watch error");
                        None
                    }
                }
            })
            .boxed()
    }
}
