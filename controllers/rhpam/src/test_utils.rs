//! Test utilities for unit testing reconcilers
//!
//! [`FakeCluster`] is an in-memory [`ClusterClient`] with the parts of API
//! server behaviour the reconcilers depend on: uids and resourceVersions are
//! assigned on create, merge patches carrying a stale resourceVersion are
//! rejected, and an object marked for deletion disappears once its finalizers
//! are gone.

use crate::cluster::{ClusterClient, ClusterError, api_resource};
use crate::config::{OperatorConfig, SsoSecretRef, SsoSecretSource};
use crate::credentials::{PASSWORD_KEY, URL_KEY, USERNAME_KEY};
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::templates::BuiltinTemplates;
use crate::token::TokenGenerator;
use async_trait::async_trait;
use crds::{RhpamEnvironment, RhpamEnvironmentSpec, RhpamIdentity, RhpamIdentitySpec, RoleSpec, UserSpec};
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keycloak_client::MockKeycloakClient;
use kube::Resource;
use kube::api::DynamicObject;
use kube::core::ApiResource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const SSO_NAMESPACE: &str = "sso";
pub const SSO_ADMIN_SECRET: &str = "sso-admin";
pub const SSO_URL: &str = "https://sso.example.com";
pub const DOMAIN: &str = "apps.example.com";

type Key = (String, String, String);

#[derive(Debug, Default)]
struct FakeState {
    objects: BTreeMap<Key, Value>,
    resource_version: u64,
    creates: usize,
}

impl FakeState {
    fn stamp(&mut self, object: &mut Value, resource: &ApiResource) {
        self.resource_version += 1;
        object["apiVersion"] = json!(resource.api_version);
        object["kind"] = json!(resource.kind);
        let metadata = &mut object["metadata"];
        if metadata.get("uid").is_none_or(Value::is_null) {
            metadata["uid"] = json!(uuid::Uuid::new_v4().to_string());
        }
        metadata["resourceVersion"] = json!(self.resource_version.to_string());
    }
}

/// In-memory cluster keyed by (plural, namespace, name)
#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

fn key(resource: &ApiResource, namespace: &str, name: &str) -> Key {
    (resource.plural.clone(), namespace.to_string(), name.to_string())
}

fn to_object(value: Value) -> Result<DynamicObject, ClusterError> {
    Ok(serde_json::from_value(value)?)
}

/// RFC 7386 JSON merge patch
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(map) = target {
                for (k, v) in entries {
                    if v.is_null() {
                        map.remove(k);
                    } else {
                        merge(map.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn is_collectable(object: &Value) -> bool {
    let metadata = &object["metadata"];
    let deleting = !metadata["deletionTimestamp"].is_null();
    let finalizers = metadata["finalizers"].as_array().is_some_and(|f| !f.is_empty());
    deleting && !finalizers
}

impl FakeCluster {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Store `object` directly, bypassing the create counter. Returns the
    /// stored form with uid and resourceVersion filled in.
    pub fn insert<K>(&self, object: &K) -> K
    where
        K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    {
        let resource = api_resource::<K>();
        let mut value = serde_json::to_value(object).unwrap();
        let namespace = object.meta().namespace.clone().unwrap();
        let name = object.meta().name.clone().unwrap();
        let mut state = self.lock();
        state.stamp(&mut value, &resource);
        state.objects.insert(key(&resource, &namespace, &name), value.clone());
        serde_json::from_value(value).unwrap()
    }

    pub fn insert_environment(&self, env: RhpamEnvironment) -> RhpamEnvironment {
        self.insert(&env)
    }

    pub fn insert_identity(&self, identity: RhpamIdentity) -> RhpamIdentity {
        self.insert(&identity)
    }

    /// Secret holding `data` as UTF-8 strings
    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let bytes: Vec<(&str, &[u8])> = data.iter().map(|(k, v)| (*k, v.as_bytes())).collect();
        self.insert_secret_bytes(namespace, name, &bytes);
    }

    pub fn insert_secret_bytes(&self, namespace: &str, name: &str, data: &[(&str, &[u8])]) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.insert(&secret);
    }

    /// The admin secret [`test_reconciler`] points at
    pub fn insert_sso_admin_secret(&self) {
        self.insert_secret(
            SSO_NAMESPACE,
            SSO_ADMIN_SECRET,
            &[(USERNAME_KEY, "admin"), (PASSWORD_KEY, "admin-password"), (URL_KEY, SSO_URL)],
        );
    }

    /// Pretend the deployment controller reported `ready` replicas
    pub fn set_ready_replicas(&self, namespace: &str, name: &str, ready: i32) {
        let resource = api_resource::<Deployment>();
        let mut state = self.lock();
        let object = state
            .objects
            .get_mut(&key(&resource, namespace, name))
            .unwrap_or_else(|| panic!("no deployment {namespace}/{name}"));
        object["status"]["readyReplicas"] = json!(ready);
    }

    /// Set the deletion timestamp the way `kubectl delete` would
    pub fn mark_deleted<K: Resource<DynamicType = ()>>(&self, namespace: &str, name: &str) {
        let resource = api_resource::<K>();
        let object_key = key(&resource, namespace, name);
        let mut state = self.lock();
        let object = state
            .objects
            .get_mut(&object_key)
            .unwrap_or_else(|| panic!("no {} {namespace}/{name}", resource.kind));
        object["metadata"]["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
        if is_collectable(object) {
            state.objects.remove(&object_key);
        }
    }

    pub fn contains<K: Resource<DynamicType = ()>>(&self, namespace: &str, name: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&key(&api_resource::<K>(), namespace, name))
    }

    /// Number of objects created through [`ClusterClient::create`]
    pub fn create_count(&self) -> usize {
        self.lock().creates
    }

    fn write(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: &Value,
        status_only: bool,
    ) -> Result<DynamicObject, ClusterError> {
        let object_key = key(resource, namespace, name);
        let mut state = self.lock();
        let Some(mut object) = state.objects.get(&object_key).cloned() else {
            return Err(ClusterError::NotFound {
                kind: resource.kind.clone(),
                name: name.to_string(),
            });
        };

        if let Some(expected) = patch["metadata"]["resourceVersion"].as_str()
            && object["metadata"]["resourceVersion"].as_str() != Some(expected)
        {
            return Err(ClusterError::Conflict {
                kind: resource.kind.clone(),
                name: name.to_string(),
            });
        }

        if status_only {
            merge(&mut object["status"], &patch["status"]);
        } else {
            merge(&mut object, patch);
        }
        state.stamp(&mut object, resource);

        if is_collectable(&object) {
            state.objects.remove(&object_key);
        } else {
            state.objects.insert(object_key, object.clone());
        }
        to_object(object)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, ClusterError> {
        self.lock()
            .objects
            .get(&key(resource, namespace, name))
            .cloned()
            .map(to_object)
            .transpose()
    }

    async fn create(&self, resource: &ApiResource, namespace: &str, object: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidObject("object has no name".to_string()))?;
        let object_key = key(resource, namespace, &name);
        let mut state = self.lock();
        if state.objects.contains_key(&object_key) {
            return Err(ClusterError::AlreadyExists {
                kind: resource.kind.clone(),
                name,
            });
        }
        let mut value = serde_json::to_value(object)?;
        value["metadata"]["namespace"] = json!(namespace);
        state.stamp(&mut value, resource);
        state.creates += 1;
        state.objects.insert(object_key, value.clone());
        to_object(value)
    }

    async fn list(&self, resource: &ApiResource, namespace: &str) -> Result<Vec<DynamicObject>, ClusterError> {
        self.lock()
            .objects
            .iter()
            .filter(|((plural, ns, _), _)| *plural == resource.plural && ns == namespace)
            .map(|(_, value)| to_object(value.clone()))
            .collect()
    }

    async fn patch(&self, resource: &ApiResource, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject, ClusterError> {
        self.write(resource, namespace, name, patch, false)
    }

    async fn patch_status(&self, resource: &ApiResource, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject, ClusterError> {
        self.write(resource, namespace, name, patch, true)
    }
}

/// Helper to create a test RhpamEnvironment without uid or status
pub fn test_environment(name: &str, namespace: &str) -> RhpamEnvironment {
    let mut env = RhpamEnvironment::new(
        name,
        RhpamEnvironmentSpec {
            domain: DOMAIN.to_string(),
            ..Default::default()
        },
    );
    env.metadata.namespace = Some(namespace.to_string());
    env
}

/// Helper to create a test RhpamIdentity without uid or status
pub fn test_identity(name: &str, namespace: &str, spec: RhpamIdentitySpec) -> RhpamIdentity {
    let mut identity = RhpamIdentity::new(name, spec);
    identity.metadata.namespace = Some(namespace.to_string());
    identity
}

pub fn identity_spec(roles: &[&str], users: Vec<UserSpec>) -> RhpamIdentitySpec {
    RhpamIdentitySpec {
        roles: roles
            .iter()
            .map(|name| RoleSpec { name: (*name).to_string() })
            .collect(),
        users,
    }
}

pub fn spec_user(username: &str, roles: &[&str]) -> UserSpec {
    UserSpec {
        username: username.to_string(),
        password: format!("{username}-password"),
        roles: roles.iter().map(ToString::to_string).collect(),
    }
}

/// Reconciler over `cluster` and `keycloak` with a fixed SSO admin secret
/// location and deterministic tokens
pub fn test_reconciler(cluster: Arc<FakeCluster>, keycloak: &MockKeycloakClient) -> Reconciler {
    let mut config = OperatorConfig::from_lookup(|_| None).unwrap();
    config.sso_secret = SsoSecretSource::Fixed(SsoSecretRef {
        namespace: SSO_NAMESPACE.to_string(),
        name: SSO_ADMIN_SECRET.to_string(),
    });
    Reconciler::new(
        cluster,
        Arc::new(keycloak.clone()),
        Arc::new(BuiltinTemplates::default()),
        &config,
        Metrics::new().unwrap(),
    )
    .with_token_generator(TokenGenerator::seeded(7))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::get_typed;

    #[tokio::test]
    async fn test_stale_resource_version_is_rejected() {
        let cluster = FakeCluster::default();
        let env = cluster.insert_environment(test_environment("demo", "team-a"));
        let resource = api_resource::<RhpamEnvironment>();
        let stale = json!({ "metadata": { "resourceVersion": "0" }, "status": { "phase": "Accepted" } });

        let err = cluster
            .patch_status(&resource, "team-a", "demo", &stale)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Conflict { .. }));

        let fresh = json!({
            "metadata": { "resourceVersion": env.metadata.resource_version },
            "status": { "phase": "Accepted" },
        });
        cluster.patch_status(&resource, "team-a", "demo", &fresh).await.unwrap();
        let stored: RhpamEnvironment = get_typed(&cluster, "team-a", "demo").await.unwrap().unwrap();
        assert_eq!(stored.status.unwrap().phase, crds::EnvironmentPhase::Accepted);
        assert_ne!(stored.metadata.resource_version, env.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_deleted_object_goes_away_with_last_finalizer() {
        let cluster = FakeCluster::default();
        let mut env = test_environment("demo", "team-a");
        env.metadata.finalizers = Some(vec![crds::FINALIZER.to_string()]);
        cluster.insert_environment(env);
        cluster.mark_deleted::<RhpamEnvironment>("team-a", "demo");
        assert!(cluster.contains::<RhpamEnvironment>("team-a", "demo"));

        cluster
            .patch(
                &api_resource::<RhpamEnvironment>(),
                "team-a",
                "demo",
                &json!({ "metadata": { "finalizers": [] } }),
            )
            .await
            .unwrap();
        assert!(!cluster.contains::<RhpamEnvironment>("team-a", "demo"));
    }

    #[test]
    fn test_merge_removes_nulls() {
        let mut target = json!({ "a": 1, "b": { "c": 2, "d": 3 } });
        merge(&mut target, &json!({ "a": null, "b": { "c": 4 } }));
        assert_eq!(target, json!({ "b": { "c": 4, "d": 3 } }));
    }
}
