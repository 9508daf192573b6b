//! Secret store backed by the Kubernetes API server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference as KubeOwnerReference;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;
use tracing::debug;

use super::{OwnerReference, SecretStore, StoredSecret};
use crate::domain::MANAGED_LABEL;
use crate::errors::{Error, Result};

pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map API errors onto the store's taxonomy.
pub(crate) fn map_kube_error(err: kube::Error, resource: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(resource),
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(resource),
        other => Error::persistence_with_source(format!("API call for {} failed", resource), Box::new(other)),
    }
}

fn to_kube(secret: &StoredSecret) -> Secret {
    let owner_references = secret.owner.as_ref().map(|owner| {
        vec![KubeOwnerReference {
            api_version: "v1".to_string(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
            ..Default::default()
        }]
    });

    Secret {
        metadata: ObjectMeta {
            name: Some(secret.name.clone()),
            namespace: Some(secret.namespace.clone()),
            annotations: (!secret.annotations.is_empty()).then(|| secret.annotations.clone()),
            labels: (!secret.labels.is_empty()).then(|| secret.labels.clone()),
            owner_references,
            resource_version: secret.resource_version.clone(),
            ..Default::default()
        },
        type_: (!secret.secret_type.is_empty()).then(|| secret.secret_type.clone()),
        data: Some(
            secret
                .data
                .iter()
                .map(|(key, value)| (key.clone(), ByteString(value.clone())))
                .collect(),
        ),
        ..Default::default()
    }
}

fn from_kube(secret: Secret) -> StoredSecret {
    let metadata = secret.metadata;
    let owner = metadata
        .owner_references
        .unwrap_or_default()
        .into_iter()
        .next()
        .map(|o| OwnerReference { kind: o.kind, name: o.name, uid: o.uid });

    StoredSecret {
        namespace: metadata.namespace.unwrap_or_default(),
        name: metadata.name.unwrap_or_default(),
        secret_type: secret.type_.unwrap_or_default(),
        data: secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, value.0))
            .collect::<BTreeMap<_, _>>(),
        annotations: metadata.annotations.unwrap_or_default(),
        labels: metadata.labels.unwrap_or_default(),
        owner,
        resource_version: metadata.resource_version,
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<StoredSecret>> {
        let resource = format!("{}/{}", namespace, name);
        self.api(namespace)
            .get_opt(name)
            .await
            .map(|secret| secret.map(from_kube))
            .map_err(|e| map_kube_error(e, &resource))
    }

    async fn create_secret(&self, secret: StoredSecret) -> Result<StoredSecret> {
        let resource = secret.resource();
        let mut object = to_kube(&secret);
        object.metadata.resource_version = None;
        let created = self
            .api(&secret.namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_kube_error(e, &resource))?;
        debug!(secret = %resource, "Created secret");
        Ok(from_kube(created))
    }

    async fn update_secret(&self, secret: StoredSecret) -> Result<StoredSecret> {
        let resource = secret.resource();
        let replaced = self
            .api(&secret.namespace)
            .replace(&secret.name, &PostParams::default(), &to_kube(&secret))
            .await
            .map_err(|e| map_kube_error(e, &resource))?;
        debug!(secret = %resource, "Replaced secret");
        Ok(from_kube(replaced))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let resource = format!("{}/{}", namespace, name);
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(map_kube_error(e, &resource)),
        }
    }

    async fn list_managed_secrets(&self) -> Result<Vec<StoredSecret>> {
        let api: Api<Secret> = Api::all(self.client.clone());
        let selector = format!("{}=true", MANAGED_LABEL);
        let list = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| map_kube_error(e, "managed secrets"))?;
        Ok(list.items.into_iter().map(from_kube).collect())
    }
}
