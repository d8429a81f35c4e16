//! Cluster API access.
//!
//! The reconcilers only need get/create/list/merge-patch on a handful of
//! kinds, so they go through the object-safe [`ClusterClient`] trait working
//! on [`DynamicObject`]s. [`KubeClusterClient`] is the real implementation;
//! tests use an in-memory fake. Typed access goes through the helpers at the
//! bottom of this module.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Errors from the cluster API
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    /// Optimistic concurrency failure (stale resourceVersion)
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("{0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

/// Namespaced object store with optimistic-concurrency merge patches
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// `Ok(None)` when the object does not exist
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ClusterError>;

    /// Fails with [`ClusterError::AlreadyExists`] when the name is taken
    async fn create(&self, resource: &ApiResource, namespace: &str, object: &DynamicObject) -> Result<DynamicObject, ClusterError>;

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<DynamicObject>, ClusterError>;

    /// JSON merge patch of the main resource
    async fn patch(&self, resource: &ApiResource, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject, ClusterError>;

    /// JSON merge patch of the status subresource
    async fn patch_status(&self, resource: &ApiResource, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject, ClusterError>;
}

/// [`ClusterClient`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

/// A 409 on create means the name is taken; on patch it means a stale write.
fn map_write_error(error: kube::Error, resource: &ApiResource, name: &str, creating: bool) -> ClusterError {
    let kind = resource.kind.clone();
    let name = name.to_string();
    match error {
        kube::Error::Api(ae) if ae.code == 409 && creating => ClusterError::AlreadyExists { kind, name },
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict { kind, name },
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound { kind, name },
        other => ClusterError::Kube(other),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ClusterError> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn create(&self, resource: &ApiResource, namespace: &str, object: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let name = object.metadata.name.clone().unwrap_or_default();
        self.api(resource, namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| map_write_error(e, resource, &name, true))
    }

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<DynamicObject>, ClusterError> {
        Ok(self.api(resource, namespace).list(&ListParams::default()).await?.items)
    }

    async fn patch(&self, resource: &ApiResource, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject, ClusterError> {
        self.api(resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error(e, resource, name, false))
    }

    async fn patch_status(&self, resource: &ApiResource, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject, ClusterError> {
        self.api(resource, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error(e, resource, name, false))
    }
}

/// The [`ApiResource`] of a statically typed kind
#[must_use]
pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// The [`ApiResource`] named by a manifest's `apiVersion` and `kind`
pub fn api_resource_of(object: &DynamicObject) -> Result<ApiResource, ClusterError> {
    let types = object.types.as_ref().ok_or_else(|| {
        ClusterError::InvalidObject(format!(
            "manifest {} has no apiVersion/kind",
            object.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))
    })?;
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    Ok(ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &types.kind)))
}

pub fn to_typed<K: DeserializeOwned>(object: DynamicObject) -> Result<K, ClusterError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

pub fn to_dynamic<K: Serialize>(object: &K) -> Result<DynamicObject, ClusterError> {
    Ok(serde_json::from_value(serde_json::to_value(object)?)?)
}

pub async fn get_typed<K>(cluster: &dyn ClusterClient, namespace: &str, name: &str) -> Result<Option<K>, ClusterError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    cluster
        .get(&api_resource::<K>(), namespace, name)
        .await?
        .map(to_typed)
        .transpose()
}

pub async fn list_typed<K>(cluster: &dyn ClusterClient, namespace: &str) -> Result<Vec<K>, ClusterError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    cluster
        .list(&api_resource::<K>(), namespace)
        .await?
        .into_iter()
        .map(to_typed)
        .collect()
}
