//! App Custom Resource Definition
//!
//! An App is the single declarative description of one application. Every
//! field except `image` is optional; absent fields resolve to their defaults
//! during decoding, so the builders downstream never deal with missing values
//! (the one exception is an explicit `port: null`, which builders reject).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Default CPU request and limit
pub const DEFAULT_CPU: &str = "200m";

/// Default memory request and limit
pub const DEFAULT_MEMORY: &str = "256Mi";

/// Default container port
pub const DEFAULT_PORT: i32 = 8080;

/// How the workload's readiness and liveness are probed
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    /// Open a TCP connection to the container port
    #[default]
    Tcp,
    /// Issue an HTTP GET against `healthCheckEndpoint` on the container port
    Http,
}

/// A literal environment variable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    /// Create an env var with a literal value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Specification for an App
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kapp.kappa.io",
    version = "v1alpha1",
    kind = "App",
    plural = "apps",
    namespaced,
    status = "AppStatus",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Base image reference, without tag or digest
    pub image: String,

    /// Image tag; wins over `imageDigest` when both are set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Image digest (e.g. `sha256:...`), used when `version` is empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_digest: String,

    /// Image pull secret name, kept on the App but not yet wired into the Workload
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_pull_secrets: String,

    /// Number of replicas
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// CPU request and limit
    #[serde(default = "default_cpu")]
    pub cpu: String,

    /// Memory request and limit
    #[serde(default = "default_memory")]
    pub memory: String,

    /// Container port
    #[serde(default = "default_port")]
    pub port: Option<i32>,

    /// Public hostname, defaults to the App name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    /// Disable Istio mutual TLS towards this App
    #[serde(default)]
    pub disable_mtls: bool,

    /// Expose the App through the ingress gateway
    #[serde(default = "default_public")]
    pub public: bool,

    /// Disable Istio sidecar injection
    #[serde(default)]
    pub disable_sidecar: bool,

    /// Node labels; each entry also becomes a pod anti-affinity match expression
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Environment variables, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Secrets whose keys are exposed as environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    /// Annotations for derived resources
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Labels for derived resources
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Configuration files, keyed by file name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Probe kind
    #[serde(default)]
    pub health_check_type: HealthCheckType,

    /// Path probed when `healthCheckType` is `http`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub health_check_endpoint: String,
}

fn default_instances() -> i32 {
    1
}

fn default_cpu() -> String {
    DEFAULT_CPU.to_string()
}

fn default_memory() -> String {
    DEFAULT_MEMORY.to_string()
}

fn default_port() -> Option<i32> {
    Some(DEFAULT_PORT)
}

fn default_public() -> bool {
    true
}

impl AppSpec {
    /// Create a spec for `image` with every other field at its default
    pub fn for_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            version: String::new(),
            image_digest: String::new(),
            image_pull_secrets: String::new(),
            instances: default_instances(),
            cpu: default_cpu(),
            memory: default_memory(),
            port: default_port(),
            hostname: String::new(),
            disable_mtls: false,
            public: default_public(),
            disable_sidecar: false,
            node_selector: BTreeMap::new(),
            env: Vec::new(),
            secrets: Vec::new(),
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            config: BTreeMap::new(),
            health_check_type: HealthCheckType::default(),
            health_check_endpoint: String::new(),
        }
    }

    /// Full image reference.
    ///
    /// Precedence: `image:version`, then `image@digest`, then `image:latest`.
    pub fn image_reference(&self) -> String {
        if !self.version.is_empty() {
            format!("{}:{}", self.image, self.version)
        } else if !self.image_digest.is_empty() {
            format!("{}@{}", self.image, self.image_digest)
        } else {
            format!("{}:latest", self.image)
        }
    }

    /// Container port, or a validation error when it was explicitly nulled
    pub fn container_port(&self, app_name: &str) -> Result<i32, Error> {
        self.port.ok_or_else(|| {
            Error::validation_for_field(app_name, "spec.port", "container port is required")
        })
    }
}

/// Condition mirrored from the Workload's status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    /// Condition type (Available, Progressing, ReplicaFailure)
    #[serde(rename = "type")]
    pub type_: String,
    /// True, False or Unknown
    pub status: String,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time the condition was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    /// Last time the condition changed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl From<&DeploymentCondition> for WorkloadCondition {
    fn from(c: &DeploymentCondition) -> Self {
        Self {
            type_: c.type_.clone(),
            status: c.status.clone(),
            reason: c.reason.clone(),
            message: c.message.clone(),
            last_update_time: c.last_update_time.as_ref().map(|t| t.0),
            last_transition_time: c.last_transition_time.as_ref().map(|t| t.0),
        }
    }
}

/// Status for an App: the observed state of its Workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    /// Generation of the Workload last observed by its controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Total replicas targeted by the Workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Replicas running the latest pod template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_replicas: Option<i32>,
    /// Replicas passing readiness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    /// Replicas available for at least minReadySeconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
    /// Replicas still required for full availability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_replicas: Option<i32>,
    /// Hash collision count of the Workload's ReplicaSets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
    /// Workload conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<WorkloadCondition>,
}

/// Every top-level status key, as serialized
const STATUS_FIELDS: [&str; 8] = [
    "observedGeneration",
    "replicas",
    "updatedReplicas",
    "readyReplicas",
    "availableReplicas",
    "unavailableReplicas",
    "collisionCount",
    "conditions",
];

impl AppStatus {
    /// JSON merge patch that makes the App's status exactly `self`.
    ///
    /// Unset fields are sent as `null`: a merge patch only removes keys it
    /// names, so omitting them would leave stale values behind.
    pub fn merge_patch(&self) -> Result<serde_json::Value, Error> {
        let mut status = serde_json::to_value(self)
            .map_err(|e| Error::serialization_for_kind("App", e.to_string()))?;
        let fields = status.as_object_mut().ok_or_else(|| {
            Error::serialization_for_kind("App", "status did not serialize to an object")
        })?;
        for key in STATUS_FIELDS {
            fields
                .entry(key.to_string())
                .or_insert(serde_json::Value::Null);
        }
        Ok(serde_json::json!({ "status": status }))
    }

    /// Mirror a Workload status. A Workload with no status yet maps to the
    /// empty AppStatus.
    pub fn from_deployment(status: Option<&DeploymentStatus>) -> Self {
        let Some(s) = status else {
            return Self::default();
        };
        Self {
            observed_generation: s.observed_generation,
            replicas: s.replicas,
            updated_replicas: s.updated_replicas,
            ready_replicas: s.ready_replicas,
            available_replicas: s.available_replicas,
            unavailable_replicas: s.unavailable_replicas,
            collision_count: s.collision_count,
            conditions: s
                .conditions
                .iter()
                .flatten()
                .map(WorkloadCondition::from)
                .collect(),
        }
    }
}
