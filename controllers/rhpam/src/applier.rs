//! Create-if-absent application of rendered manifests.
//!
//! Objects are stamped with a controller owner reference to their
//! [`RhpamEnvironment`] and created once. Existing objects are never updated
//! or deleted here; garbage collection follows the owner reference.

use crate::cluster::{ClusterClient, ClusterError, api_resource, api_resource_of, to_dynamic};
use crate::error::ControllerError;
use crate::templates::{RhpamParameters, Template, TemplateRenderer};
use crds::RhpamEnvironment;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What [`ResourceApplier`] did with an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    AlreadyPresent,
}

#[derive(Clone)]
pub struct ResourceApplier {
    cluster: Arc<dyn ClusterClient>,
    templates: Arc<dyn TemplateRenderer>,
}

impl std::fmt::Debug for ResourceApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceApplier").finish_non_exhaustive()
    }
}

impl ResourceApplier {
    pub fn new(cluster: Arc<dyn ClusterClient>, templates: Arc<dyn TemplateRenderer>) -> Self {
        Self { cluster, templates }
    }

    /// Render `template`, then create the object unless it already exists
    pub async fn apply(
        &self,
        owner: &RhpamEnvironment,
        template: Template,
        params: &RhpamParameters,
    ) -> Result<Applied, ControllerError> {
        let manifest = self.templates.render(template, params)?;
        let object: DynamicObject = serde_yaml::from_slice(&manifest)
            .map_err(|e| ControllerError::Template(format!("template {template} did not decode: {e}")))?;
        self.ensure_object(owner, object).await
    }

    pub async fn ensure_object(
        &self,
        owner: &RhpamEnvironment,
        mut object: DynamicObject,
    ) -> Result<Applied, ControllerError> {
        let resource = api_resource_of(&object)?;
        let namespace = owner
            .metadata
            .namespace
            .clone()
            .ok_or(ControllerError::MissingMetadata("metadata.namespace"))?;
        let name = object
            .metadata
            .name
            .clone()
            .ok_or(ControllerError::Template(format!("{} manifest has no name", resource.kind)))?;

        if self.cluster.get(&resource, &namespace, &name).await?.is_some() {
            debug!("{} {}/{} already exists", resource.kind, namespace, name);
            return Ok(Applied::AlreadyPresent);
        }

        let owner_ref = owner
            .controller_owner_ref(&())
            .ok_or(ControllerError::MissingMetadata("metadata.uid"))?;
        object.metadata.namespace = Some(namespace.clone());
        object.metadata.owner_references = Some(vec![owner_ref]);

        match self.cluster.create(&resource, &namespace, &object).await {
            Ok(_) => {
                info!("Created {} {}/{}", resource.kind, namespace, name);
                Ok(Applied::Created)
            }
            // Lost a race with another writer; the object is there either way.
            Err(ClusterError::AlreadyExists { .. }) => {
                debug!("{} {}/{} appeared while creating it", resource.kind, namespace, name);
                Ok(Applied::AlreadyPresent)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Opaque secret holding `data`
    pub async fn ensure_secret(
        &self,
        owner: &RhpamEnvironment,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<Applied, ControllerError> {
        let secret = Secret {
            metadata: named(name),
            type_: Some("Opaque".to_string()),
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v.into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.ensure_typed(owner, &secret).await
    }

    pub async fn ensure_config_map(
        &self,
        owner: &RhpamEnvironment,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<Applied, ControllerError> {
        let config_map = ConfigMap {
            metadata: named(name),
            data: Some(data),
            ..Default::default()
        };
        self.ensure_typed(owner, &config_map).await
    }

    async fn ensure_typed<K>(&self, owner: &RhpamEnvironment, object: &K) -> Result<Applied, ControllerError>
    where
        K: Resource<DynamicType = ()> + serde::Serialize,
    {
        let mut dynamic = to_dynamic(object)?;
        let resource = api_resource::<K>();
        dynamic.types = Some(kube::core::TypeMeta {
            api_version: resource.api_version,
            kind: resource.kind,
        });
        self.ensure_object(owner, dynamic).await
    }
}

fn named(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(BTreeMap::from([("app".to_string(), "rhpam".to_string())])),
        ..Default::default()
    }
}
