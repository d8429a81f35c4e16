//! Manifest rendering.
//!
//! Every cluster object the provisioning phases create, except the generated
//! secrets, comes out of a [`TemplateRenderer`] as a YAML manifest. The
//! reconciler only ever asks for a [`Template`] by name with the
//! [`RhpamParameters`] of one environment; [`BuiltinTemplates`] is the
//! renderer the operator ships with.

use crate::error::ControllerError;
use crate::reconciler::principals::{ADMIN_USER, CONTROLLER_USER, EXECUTION_USER, MAVEN_USER};
use crds::RhpamEnvironment;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const SERVICE_ACCOUNT: &str = "rhpam";
pub const DATABASE: &str = "rhpam-postgresql";
pub const DATABASE_NAME: &str = "rhpam";
pub const DATABASE_INIT_CONFIG_MAP: &str = "rhpam-postgresql-init";
pub const BUSINESS_CENTRAL: &str = "rhpam-bc";
pub const KIE_SERVER: &str = "rhpam-kieserver";
pub const BC_SSO_SECRET: &str = "rhpam-bc-sso";
pub const KS_SSO_SECRET: &str = "rhpam-kieserver-sso";

const DATABASE_IMAGE: &str = "registry.redhat.io/rhscl/postgresql-96-rhel7:latest";
const BUSINESS_CENTRAL_IMAGE: &str = "registry.redhat.io/rhpam-7/rhpam71-businesscentral-openshift:1.0";
const KIE_SERVER_IMAGE: &str = "registry.redhat.io/rhpam-7/rhpam71-kieserver-openshift:1.0";

const INIT_MOUNT: &str = "/opt/app-root/src/postgresql-init";
const CREATE_DATABASE_SCRIPT: &str = "create_rhpam_database.sh";
const WAIT_FOR_DATABASE_SCRIPT: &str = "wait_for_postgresql.sh";

/// Files loaded into the database init config map from a resource directory
pub const INIT_FILES: [&str; 5] = [
    "postgresql-jbpm-schema.sql",
    "postgresql-jbpm-lo-trigger-clob.sql",
    "quartz_tables_postgres.sql",
    CREATE_DATABASE_SCRIPT,
    WAIT_FOR_DATABASE_SCRIPT,
];

/// The manifests known to the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    ServiceAccount,
    DatabasePvc,
    DatabaseService,
    DatabaseDeployment,
    BusinessCentralPvc,
    BusinessCentralService,
    BusinessCentralRoute,
    BusinessCentralDeployment,
    KieServerService,
    KieServerRoute,
    KieServerDeployment,
}

impl Template {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ServiceAccount => "service-account",
            Self::DatabasePvc => "postgresql-pvc",
            Self::DatabaseService => "postgresql-service",
            Self::DatabaseDeployment => "postgresql-deployment",
            Self::BusinessCentralPvc => "bc-pvc",
            Self::BusinessCentralService => "bc-service",
            Self::BusinessCentralRoute => "bc-route",
            Self::BusinessCentralDeployment => "bc-deployment",
            Self::KieServerService => "ks-service",
            Self::KieServerRoute => "ks-route",
            Self::KieServerDeployment => "ks-deployment",
        }
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseParameters {
    pub volume_capacity: String,
    pub max_connections: u32,
    pub shared_buffers: String,
    pub max_prepared_transactions: u32,
    pub memory_limit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessCentralParameters {
    pub volume_capacity: String,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub gc_max_meta_size: u32,
    pub kie_mbeans: String,
    pub java_opts_append: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KieServerParameters {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub gc_max_meta_size: u32,
    pub kie_mbeans: String,
    pub kie_server_id: String,
    pub filter_classes: bool,
    pub bypass_auth_user: bool,
}

/// Everything a template needs to know about one environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RhpamParameters {
    pub environment: String,
    pub namespace: String,
    pub domain: String,
    pub database: DatabaseParameters,
    pub business_central: BusinessCentralParameters,
    pub kie_server: KieServerParameters,
}

impl RhpamParameters {
    /// Parameters of `env` with every unset override defaulted
    pub fn for_environment(env: &RhpamEnvironment) -> Result<Self, ControllerError> {
        let environment = env
            .metadata
            .name
            .clone()
            .ok_or(ControllerError::MissingMetadata("metadata.name"))?;
        let namespace = env
            .metadata
            .namespace
            .clone()
            .ok_or(ControllerError::MissingMetadata("metadata.namespace"))?;
        let spec = env.spec.with_defaults();
        let db = spec.config.database;
        let bc = spec.config.business_central;
        let ks = spec.config.kie_server;

        Ok(Self {
            environment,
            namespace,
            domain: spec.domain.trim().to_string(),
            database: DatabaseParameters {
                volume_capacity: db.persistent_volume_capacity.unwrap_or_default(),
                max_connections: db.max_connections.unwrap_or_default(),
                shared_buffers: db.shared_buffers.unwrap_or_default(),
                max_prepared_transactions: db.max_prepared_transactions.unwrap_or_default(),
                memory_limit: db.memory_limit.unwrap_or_default(),
            },
            business_central: BusinessCentralParameters {
                volume_capacity: bc.persistent_volume_capacity.unwrap_or_default(),
                cpu_request: bc.cpu_request.unwrap_or_default(),
                cpu_limit: bc.cpu_limit.unwrap_or_default(),
                memory_request: bc.memory_request.unwrap_or_default(),
                memory_limit: bc.memory_limit.unwrap_or_default(),
                gc_max_meta_size: bc.gc_max_meta_size.unwrap_or_default(),
                kie_mbeans: bc.kie_mbeans.unwrap_or_default(),
                java_opts_append: bc.java_opts_append.unwrap_or_default(),
            },
            kie_server: KieServerParameters {
                cpu_request: ks.cpu_request.unwrap_or_default(),
                cpu_limit: ks.cpu_limit.unwrap_or_default(),
                memory_request: ks.memory_request.unwrap_or_default(),
                memory_limit: ks.memory_limit.unwrap_or_default(),
                gc_max_meta_size: ks.gc_max_meta_size.unwrap_or_default(),
                kie_mbeans: ks.kie_mbeans.unwrap_or_default(),
                kie_server_id: ks.kie_server_id.unwrap_or_default(),
                filter_classes: ks.filter_classes.unwrap_or(true),
                bypass_auth_user: ks.bypass_auth_user.unwrap_or(false),
            },
        })
    }

    /// Route host of a deployment: `<deployment>-<namespace>.<domain>`
    #[must_use]
    pub fn route_host(&self, deployment: &str) -> String {
        format!("{deployment}-{}.{}", self.namespace, self.domain)
    }

    /// Public URL of a deployment's route
    #[must_use]
    pub fn route_url(&self, deployment: &str) -> String {
        format!("https://{}", self.route_host(deployment))
    }
}

/// Produces manifests and database init data for an environment
pub trait TemplateRenderer: Send + Sync {
    /// YAML manifest for `template`
    fn render(&self, template: Template, params: &RhpamParameters) -> Result<Vec<u8>, ControllerError>;

    /// Content of the database init config map, keyed by file name
    fn init_data(&self, params: &RhpamParameters) -> Result<BTreeMap<String, String>, ControllerError>;
}

/// Manifests built in code, init scripts embedded in the binary.
///
/// With a resource directory set, the init data is read from disk instead:
/// all of [`INIT_FILES`] must be present there.
#[derive(Debug, Clone, Default)]
pub struct BuiltinTemplates {
    resource_dir: Option<PathBuf>,
}

impl BuiltinTemplates {
    #[must_use]
    pub fn new(resource_dir: Option<PathBuf>) -> Self {
        Self { resource_dir }
    }
}

impl TemplateRenderer for BuiltinTemplates {
    fn render(&self, template: Template, params: &RhpamParameters) -> Result<Vec<u8>, ControllerError> {
        let manifest = match template {
            Template::ServiceAccount => service_account(),
            Template::DatabasePvc => pvc(DATABASE, &params.database.volume_capacity),
            Template::DatabaseService => service(DATABASE, "postgresql", 5432),
            Template::DatabaseDeployment => database_deployment(params),
            Template::BusinessCentralPvc => pvc(BUSINESS_CENTRAL, &params.business_central.volume_capacity),
            Template::BusinessCentralService => service(BUSINESS_CENTRAL, "http", 8080),
            Template::BusinessCentralRoute => route(BUSINESS_CENTRAL, params),
            Template::BusinessCentralDeployment => business_central_deployment(params),
            Template::KieServerService => service(KIE_SERVER, "http", 8080),
            Template::KieServerRoute => route(KIE_SERVER, params),
            Template::KieServerDeployment => kie_server_deployment(params),
        };
        Ok(serde_yaml::to_string(&manifest)?.into_bytes())
    }

    fn init_data(&self, _params: &RhpamParameters) -> Result<BTreeMap<String, String>, ControllerError> {
        let Some(dir) = &self.resource_dir else {
            return Ok(BTreeMap::from([
                (
                    CREATE_DATABASE_SCRIPT.to_string(),
                    include_str!("../resources/create_rhpam_database.sh").to_string(),
                ),
                (
                    WAIT_FOR_DATABASE_SCRIPT.to_string(),
                    include_str!("../resources/wait_for_postgresql.sh").to_string(),
                ),
            ]));
        };

        INIT_FILES
            .iter()
            .map(|file| {
                std::fs::read_to_string(dir.join(file))
                    .map(|content| ((*file).to_string(), content))
                    .map_err(|e| ControllerError::Template(format!("Error reading resource {file}: {e}")))
            })
            .collect()
    }
}

fn labels(component: &str) -> Value {
    json!({ "app": "rhpam", "deployment": component })
}

fn metadata(name: &str) -> Value {
    json!({ "name": name, "labels": labels(name) })
}

fn service_account() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": metadata(SERVICE_ACCOUNT),
    })
}

fn pvc(name: &str, capacity: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": metadata(name),
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": capacity } },
        },
    })
}

fn service(name: &str, port_name: &str, port: u16) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(name),
        "spec": {
            "selector": labels(name),
            "ports": [{ "name": port_name, "port": port, "targetPort": port, "protocol": "TCP" }],
        },
    })
}

fn route(name: &str, params: &RhpamParameters) -> Value {
    json!({
        "apiVersion": "route.openshift.io/v1",
        "kind": "Route",
        "metadata": metadata(name),
        "spec": {
            "host": params.route_host(name),
            "to": { "kind": "Service", "name": name },
            "port": { "targetPort": "http" },
            "tls": { "termination": "edge", "insecureEdgeTerminationPolicy": "Redirect" },
        },
    })
}

fn env(name: &str, value: impl std::fmt::Display) -> Value {
    json!({ "name": name, "value": value.to_string() })
}

fn secret_env(name: &str, secret: &str, key: &str) -> Value {
    json!({ "name": name, "valueFrom": { "secretKeyRef": { "name": secret, "key": key } } })
}

fn deployment(name: &str, pod_spec: Value) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata(name),
        "spec": {
            "replicas": 1,
            "strategy": { "type": "Recreate" },
            "selector": { "matchLabels": labels(name) },
            "template": {
                "metadata": { "name": name, "labels": labels(name) },
                "spec": pod_spec,
            },
        },
    })
}

fn database_deployment(params: &RhpamParameters) -> Value {
    let db = &params.database;
    let start_hook = format!("{INIT_MOUNT}/{WAIT_FOR_DATABASE_SCRIPT} && {INIT_MOUNT}/{CREATE_DATABASE_SCRIPT}");
    deployment(
        DATABASE,
        json!({
            "serviceAccountName": SERVICE_ACCOUNT,
            "terminationGracePeriodSeconds": 60,
            "containers": [{
                "name": "postgresql",
                "image": DATABASE_IMAGE,
                "imagePullPolicy": "IfNotPresent",
                "ports": [{ "name": "postgresql", "containerPort": 5432, "protocol": "TCP" }],
                "env": [
                    secret_env("POSTGRESQL_USER", DATABASE, "database-user"),
                    secret_env("POSTGRESQL_PASSWORD", DATABASE, "database-password"),
                    secret_env("POSTGRESQL_DATABASE", DATABASE, "database-name"),
                    env("POSTGRESQL_MAX_CONNECTIONS", db.max_connections),
                    env("POSTGRESQL_MAX_PREPARED_TRANSACTIONS", db.max_prepared_transactions),
                    env("POSTGRESQL_SHARED_BUFFERS", &db.shared_buffers),
                ],
                "lifecycle": {
                    "postStart": { "exec": { "command": ["/bin/sh", "-c", start_hook] } },
                },
                "livenessProbe": {
                    "tcpSocket": { "port": 5432 },
                    "initialDelaySeconds": 30,
                    "timeoutSeconds": 1,
                },
                "readinessProbe": {
                    "exec": {
                        "command": [
                            "/bin/sh", "-i", "-c",
                            "psql -h 127.0.0.1 -U $POSTGRESQL_USER -q -d $POSTGRESQL_DATABASE -c 'SELECT 1'",
                        ],
                    },
                    "initialDelaySeconds": 5,
                    "timeoutSeconds": 1,
                },
                "resources": { "limits": { "memory": &db.memory_limit } },
                "volumeMounts": [
                    { "name": "data", "mountPath": "/var/lib/pgsql/data" },
                    { "name": "init", "mountPath": INIT_MOUNT },
                ],
            }],
            "volumes": [
                { "name": "data", "persistentVolumeClaim": { "claimName": DATABASE } },
                { "name": "init", "configMap": { "name": DATABASE_INIT_CONFIG_MAP, "defaultMode": 0o755 } },
            ],
        }),
    )
}

fn sso_env(secret: &str, client_prefix: &str) -> Vec<Value> {
    vec![
        secret_env("SSO_URL", secret, "sso-url"),
        secret_env("SSO_REALM", secret, "realm"),
        secret_env(&format!("{client_prefix}_SSO_CLIENT"), secret, "client"),
        secret_env(&format!("{client_prefix}_SSO_SECRET"), secret, "client-secret"),
        env("SSO_DISABLE_SSL_CERTIFICATE_VALIDATION", true),
        env("SSO_PRINCIPAL_ATTRIBUTE", "preferred_username"),
    ]
}

fn business_central_deployment(params: &RhpamParameters) -> Value {
    let bc = &params.business_central;
    let mut container_env = vec![
        env("KIE_ADMIN_USER", ADMIN_USER.username),
        env("KIE_ADMIN_PWD", ADMIN_USER.password),
        env("KIE_SERVER_CONTROLLER_USER", CONTROLLER_USER.username),
        env("KIE_SERVER_CONTROLLER_PWD", CONTROLLER_USER.password),
        env("KIE_SERVER_USER", EXECUTION_USER.username),
        env("KIE_SERVER_PWD", EXECUTION_USER.password),
        env("KIE_MAVEN_USER", MAVEN_USER.username),
        env("KIE_MAVEN_PWD", MAVEN_USER.password),
        env("KIE_MBEANS", &bc.kie_mbeans),
        env("GC_MAX_METASPACE_SIZE", bc.gc_max_meta_size),
        env("JAVA_OPTS_APPEND", &bc.java_opts_append),
        env("BUSINESS_CENTRAL_HOSTNAME_HTTPS", params.route_host(BUSINESS_CENTRAL)),
    ];
    container_env.extend(sso_env(BC_SSO_SECRET, "BUSINESS_CENTRAL"));

    deployment(
        BUSINESS_CENTRAL,
        json!({
            "serviceAccountName": SERVICE_ACCOUNT,
            "terminationGracePeriodSeconds": 60,
            "containers": [{
                "name": BUSINESS_CENTRAL,
                "image": BUSINESS_CENTRAL_IMAGE,
                "imagePullPolicy": "IfNotPresent",
                "ports": [
                    { "name": "http", "containerPort": 8080, "protocol": "TCP" },
                    { "name": "git-ssh", "containerPort": 8001, "protocol": "TCP" },
                ],
                "env": container_env,
                "livenessProbe": {
                    "httpGet": { "path": "/kie-wb.jsp", "port": 8080 },
                    "initialDelaySeconds": 180,
                    "periodSeconds": 15,
                    "timeoutSeconds": 2,
                    "failureThreshold": 3,
                },
                "readinessProbe": {
                    "httpGet": { "path": "/kie-wb.jsp", "port": 8080 },
                    "initialDelaySeconds": 60,
                    "periodSeconds": 30,
                    "timeoutSeconds": 2,
                    "failureThreshold": 6,
                },
                "resources": {
                    "requests": { "cpu": &bc.cpu_request, "memory": &bc.memory_request },
                    "limits": { "cpu": &bc.cpu_limit, "memory": &bc.memory_limit },
                },
                "volumeMounts": [{ "name": "data", "mountPath": "/opt/kie/data" }],
            }],
            "volumes": [
                { "name": "data", "persistentVolumeClaim": { "claimName": BUSINESS_CENTRAL } },
            ],
        }),
    )
}

fn kie_server_deployment(params: &RhpamParameters) -> Value {
    let ks = &params.kie_server;
    let mut container_env = vec![
        env("KIE_SERVER_ID", &ks.kie_server_id),
        env("KIE_SERVER_USER", EXECUTION_USER.username),
        env("KIE_SERVER_PWD", EXECUTION_USER.password),
        env("KIE_SERVER_CONTROLLER_USER", CONTROLLER_USER.username),
        env("KIE_SERVER_CONTROLLER_PWD", CONTROLLER_USER.password),
        env("KIE_SERVER_CONTROLLER_SERVICE", BUSINESS_CENTRAL),
        env("KIE_SERVER_CONTROLLER_PROTOCOL", "ws"),
        env("KIE_SERVER_ROUTE_NAME", KIE_SERVER),
        env("KIE_SERVER_BYPASS_AUTH_USER", ks.bypass_auth_user),
        env("DROOLS_SERVER_FILTER_CLASSES", ks.filter_classes),
        env("KIE_MBEANS", &ks.kie_mbeans),
        env("GC_MAX_METASPACE_SIZE", ks.gc_max_meta_size),
        env("RHPAMCENTR_MAVEN_REPO_SERVICE", BUSINESS_CENTRAL),
        env("RHPAMCENTR_MAVEN_REPO_PATH", "/maven2/"),
        env("RHPAMCENTR_MAVEN_REPO_USERNAME", MAVEN_USER.username),
        env("RHPAMCENTR_MAVEN_REPO_PASSWORD", MAVEN_USER.password),
        env("RHPAM_DRIVER", "postgresql"),
        secret_env("RHPAM_USERNAME", DATABASE, "database-user"),
        secret_env("RHPAM_PASSWORD", DATABASE, "database-password"),
        secret_env("RHPAM_DATABASE", DATABASE, "database-name"),
        env("RHPAM_SERVICE_HOST", DATABASE),
        env("RHPAM_SERVICE_PORT", 5432),
        env("KIE_SERVER_PERSISTENCE_DIALECT", "org.hibernate.dialect.PostgreSQLDialect"),
        env("KIE_SERVER_HOSTNAME_HTTPS", params.route_host(KIE_SERVER)),
    ];
    container_env.extend(sso_env(KS_SSO_SECRET, "KIE_SERVER"));

    deployment(
        KIE_SERVER,
        json!({
            "serviceAccountName": SERVICE_ACCOUNT,
            "terminationGracePeriodSeconds": 60,
            "containers": [{
                "name": KIE_SERVER,
                "image": KIE_SERVER_IMAGE,
                "imagePullPolicy": "IfNotPresent",
                "ports": [{ "name": "http", "containerPort": 8080, "protocol": "TCP" }],
                "env": container_env,
                "livenessProbe": {
                    "httpGet": { "path": "/services/rest/server/healthcheck", "port": 8080 },
                    "initialDelaySeconds": 180,
                    "periodSeconds": 15,
                    "timeoutSeconds": 2,
                    "failureThreshold": 3,
                },
                "readinessProbe": {
                    "httpGet": { "path": "/services/rest/server/readycheck", "port": 8080 },
                    "initialDelaySeconds": 60,
                    "periodSeconds": 30,
                    "timeoutSeconds": 2,
                    "failureThreshold": 6,
                },
                "resources": {
                    "requests": { "cpu": &ks.cpu_request, "memory": &ks.memory_request },
                    "limits": { "cpu": &ks.cpu_limit, "memory": &ks.memory_limit },
                },
            }],
        }),
    )
}
