//! Workload (Deployment) builder, evaluator and reconciler
//!
//! The Workload runs exactly one container named after the App. Besides
//! converging the Deployment itself, reconciling the Workload mirrors the
//! observed Deployment status onto the App's status sub-resource.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, ContainerPort, EnvFromSource, EnvVar, HTTPGetAction,
    PodAffinityTerm, PodAntiAffinity, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecretEnvSource, SecurityContext, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, info};

use kappa_common::crd::{App, AppStatus, HealthCheckType};
use kappa_common::kube_utils::{app_namespace, non_empty, owned_meta};
use kappa_common::{Error, APP_LABEL};

use crate::client::AppKubeClient;
use crate::converge::{plan, Outcome, Plan, ResourceKind};
use crate::equality::{expect_each_matched, expect_eq, expect_subset, Drift, Evaluation};

/// Istio rewrites HTTP probes so they pass through the sidecar
pub const REWRITE_PROBERS_ANNOTATION: &str = "sidecar.istio.io/rewriteAppHTTPProbers";
/// Default seccomp profile for the pod
pub const SECCOMP_ANNOTATION: &str = "seccomp.security.alpha.kubernetes.io/pod";
/// Allow the cluster autoscaler to evict the pod
pub const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";
/// Istio sidecar injection toggle
pub const SIDECAR_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";

/// Topology key for the pod anti-affinity rule
pub const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// User, group and fsGroup id the pod runs as
pub const RUN_AS_ID: i64 = 1000;

const READINESS_INITIAL_DELAY: i32 = 10;
const READINESS_FAILURE_THRESHOLD: i32 = 12;
const LIVENESS_INITIAL_DELAY: i32 = 120;
const LIVENESS_FAILURE_THRESHOLD: i32 = 1;
const PROBE_PERIOD_SECONDS: i32 = 10;
const TCP_PROBE_TIMEOUT_SECONDS: i32 = 1;
const HTTP_PROBE_TIMEOUT_SECONDS: i32 = 10;

// =============================================================================
// Build
// =============================================================================

/// Labels on the Workload, its pods and the Endpoint: the App's own labels
/// plus `app: <name>`
pub fn app_labels(app: &App) -> BTreeMap<String, String> {
    let mut labels = app.labels().clone();
    labels.insert(APP_LABEL.to_string(), app.name_any());
    labels
}

/// Pod annotations: the App's annotations, the fixed operational
/// annotations, and the sidecar opt-out when injection is disabled
pub fn pod_annotations(app: &App) -> BTreeMap<String, String> {
    let mut annotations = app.spec.annotations.clone();
    annotations.insert(REWRITE_PROBERS_ANNOTATION.to_string(), "true".to_string());
    annotations.insert(SECCOMP_ANNOTATION.to_string(), "runtime/default".to_string());
    annotations.insert(SAFE_TO_EVICT_ANNOTATION.to_string(), "true".to_string());
    if app.spec.disable_sidecar {
        annotations.insert(SIDECAR_INJECT_ANNOTATION.to_string(), "false".to_string());
    }
    annotations
}

/// Required pod anti-affinity built from the node selector.
///
/// A single term on the hostname topology whose label selector carries one
/// `In` expression per node-selector entry, in key order. An empty node
/// selector still yields the term, with an empty label selector.
pub fn anti_affinity(node_selector: &BTreeMap<String, String>) -> Affinity {
    let expressions: Vec<LabelSelectorRequirement> = node_selector
        .iter()
        .map(|(key, value)| LabelSelectorRequirement {
            key: key.clone(),
            operator: "In".to_string(),
            values: Some(vec![value.clone()]),
        })
        .collect();

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: (!expressions.is_empty()).then_some(expressions),
                    match_labels: None,
                }),
                topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Rolling update: a single replica is never taken down before its
/// replacement is ready; surge is always one.
pub fn rolling_update(instances: i32) -> DeploymentStrategy {
    let max_unavailable = if instances == 1 { 0 } else { 1 };
    DeploymentStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateDeployment {
            max_unavailable: Some(IntOrString::Int(max_unavailable)),
            max_surge: Some(IntOrString::Int(1)),
        }),
    }
}

/// Health probe against the container port
pub fn probe(app: &App, port: i32, initial_delay: i32, failure_threshold: i32) -> Probe {
    let base = Probe {
        initial_delay_seconds: Some(initial_delay),
        failure_threshold: Some(failure_threshold),
        period_seconds: Some(PROBE_PERIOD_SECONDS),
        success_threshold: Some(1),
        ..Default::default()
    };
    match app.spec.health_check_type {
        HealthCheckType::Tcp => Probe {
            timeout_seconds: Some(TCP_PROBE_TIMEOUT_SECONDS),
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                host: None,
            }),
            ..base
        },
        HealthCheckType::Http => {
            let path = &app.spec.health_check_endpoint;
            Probe {
                timeout_seconds: Some(HTTP_PROBE_TIMEOUT_SECONDS),
                http_get: Some(HTTPGetAction {
                    port: IntOrString::Int(port),
                    path: (!path.is_empty()).then(|| path.clone()),
                    scheme: Some("HTTP".to_string()),
                    ..Default::default()
                }),
                ..base
            }
        }
    }
}

fn sizing(app: &App) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(app.spec.cpu.clone())),
        ("memory".to_string(), Quantity(app.spec.memory.clone())),
    ])
}

fn container_security_context() -> SecurityContext {
    SecurityContext {
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            add: None,
        }),
        privileged: Some(false),
        run_as_user: Some(RUN_AS_ID),
        run_as_group: Some(RUN_AS_ID),
        run_as_non_root: Some(true),
        read_only_root_filesystem: Some(false),
        allow_privilege_escalation: Some(false),
        ..Default::default()
    }
}

fn container(app: &App, port: i32) -> Container {
    let env: Vec<EnvVar> = app
        .spec
        .env
        .iter()
        .map(|e| EnvVar {
            name: e.name.clone(),
            value: (!e.value.is_empty()).then(|| e.value.clone()),
            value_from: None,
        })
        .collect();
    let env_from: Vec<EnvFromSource> = app
        .spec
        .secrets
        .iter()
        .map(|secret| EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: secret.clone(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Container {
        name: app.name_any(),
        image: Some(app.spec.image_reference()),
        env: (!env.is_empty()).then_some(env),
        env_from: (!env_from.is_empty()).then_some(env_from),
        image_pull_policy: Some("Always".to_string()),
        readiness_probe: Some(probe(
            app,
            port,
            READINESS_INITIAL_DELAY,
            READINESS_FAILURE_THRESHOLD,
        )),
        liveness_probe: Some(probe(
            app,
            port,
            LIVENESS_INITIAL_DELAY,
            LIVENESS_FAILURE_THRESHOLD,
        )),
        ports: Some(vec![ContainerPort {
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(sizing(app)),
            limits: Some(sizing(app)),
            ..Default::default()
        }),
        security_context: Some(container_security_context()),
        ..Default::default()
    }
}

/// Build the desired Workload for an App
pub fn build_workload(app: &App) -> Result<Deployment, Error> {
    let name = app.name_any();
    let port = app.spec.container_port(&name)?;
    let labels = app_labels(app);

    Ok(Deployment {
        metadata: owned_meta(app, labels.clone(), app.spec.annotations.clone())?,
        spec: Some(DeploymentSpec {
            replicas: Some(app.spec.instances),
            strategy: Some(rolling_update(app.spec.instances)),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), name.clone())])),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations(app)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    security_context: Some(PodSecurityContext {
                        fs_group: Some(RUN_AS_ID),
                        ..Default::default()
                    }),
                    service_account_name: Some(name),
                    affinity: Some(anti_affinity(&app.spec.node_selector)),
                    node_selector: non_empty(app.spec.node_selector.clone()),
                    containers: vec![container(app, port)],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

// =============================================================================
// Evaluate
// =============================================================================

fn pod_meta(d: &Deployment) -> Option<&ObjectMeta> {
    d.spec.as_ref().and_then(|s| s.template.metadata.as_ref())
}

fn pod_spec(d: &Deployment) -> Option<&PodSpec> {
    d.spec.as_ref().and_then(|s| s.template.spec.as_ref())
}

fn first_container(d: &Deployment) -> Option<&Container> {
    pod_spec(d).and_then(|s| s.containers.first())
}

/// Compare a desired Workload against the observed one.
///
/// Labels and annotations (object and pod template) only need to be present
/// in the observed object; env and envFrom entries only need a match
/// somewhere in the observed list. Everything else must be equal. Checks
/// run in a fixed order and stop at the first difference.
pub fn evaluate_workload(desired: &Deployment, actual: &Deployment) -> Evaluation {
    expect_subset(
        "labels",
        desired.metadata.labels.as_ref(),
        actual.metadata.labels.as_ref(),
    )?;
    expect_subset(
        "annotations",
        desired.metadata.annotations.as_ref(),
        actual.metadata.annotations.as_ref(),
    )?;
    expect_eq(
        "replicas",
        &desired.spec.as_ref().and_then(|s| s.replicas),
        &actual.spec.as_ref().and_then(|s| s.replicas),
    )?;

    let (dpm, apm) = (pod_meta(desired), pod_meta(actual));
    expect_subset(
        "podLabels",
        dpm.and_then(|m| m.labels.as_ref()),
        apm.and_then(|m| m.labels.as_ref()),
    )?;
    expect_subset(
        "podAnnotations",
        dpm.and_then(|m| m.annotations.as_ref()),
        apm.and_then(|m| m.annotations.as_ref()),
    )?;

    let (dps, aps) = (pod_spec(desired), pod_spec(actual));
    expect_eq(
        "securityContext",
        &dps.and_then(|s| s.security_context.as_ref())
            .and_then(|c| c.fs_group),
        &aps.and_then(|s| s.security_context.as_ref())
            .and_then(|c| c.fs_group),
    )?;
    expect_eq(
        "serviceAccountName",
        &dps.and_then(|s| s.service_account_name.as_ref()),
        &aps.and_then(|s| s.service_account_name.as_ref()),
    )?;
    expect_eq(
        "affinity",
        &dps.and_then(|s| s.affinity.as_ref()),
        &aps.and_then(|s| s.affinity.as_ref()),
    )?;
    expect_eq(
        "nodeSelector",
        &dps.and_then(|s| s.node_selector.as_ref()),
        &aps.and_then(|s| s.node_selector.as_ref()),
    )?;

    let (Some(dc), Some(ac)) = (first_container(desired), first_container(actual)) else {
        return Err(Drift::new(
            "containers",
            &dps.map(|s| &s.containers),
            &aps.map(|s| &s.containers),
        ));
    };
    evaluate_container(dc, ac)
}

fn evaluate_container(desired: &Container, actual: &Container) -> Evaluation {
    expect_eq("containerName", &desired.name, &actual.name)?;
    expect_eq("image", &desired.image, &actual.image)?;
    expect_each_matched(
        "containerEnv",
        desired.env.as_deref().unwrap_or_default(),
        actual.env.as_deref().unwrap_or_default(),
        |d, a| d.name == a.name && d.value == a.value,
    )?;
    expect_each_matched(
        "containerEnvFrom",
        desired.env_from.as_deref().unwrap_or_default(),
        actual.env_from.as_deref().unwrap_or_default(),
        same_env_source,
    )?;
    expect_eq(
        "imagePullPolicy",
        &desired.image_pull_policy,
        &actual.image_pull_policy,
    )?;
    expect_eq(
        "readinessProbe",
        &desired.readiness_probe,
        &actual.readiness_probe,
    )?;
    expect_eq("livenessProbe", &desired.liveness_probe, &actual.liveness_probe)?;
    expect_eq("ports", &desired.ports, &actual.ports)?;
    expect_eq("resources", &desired.resources, &actual.resources)?;
    expect_eq(
        "containerSecurityContext",
        &desired.security_context,
        &actual.security_context,
    )
}

/// Two envFrom entries reference the same Secret or the same ConfigMap
fn same_env_source(desired: &EnvFromSource, actual: &EnvFromSource) -> bool {
    let secret = match (&desired.secret_ref, &actual.secret_ref) {
        (Some(d), Some(a)) => d.name == a.name,
        _ => false,
    };
    let config_map = match (&desired.config_map_ref, &actual.config_map_ref) {
        (Some(d), Some(a)) => d.name == a.name,
        _ => false,
    };
    secret || config_map
}

// =============================================================================
// Reconcile
// =============================================================================

/// Converge the App's Workload and mirror its status onto the App.
///
/// The status is written only when the Workload already existed and its
/// mirrored status differs from what the App carries.
pub async fn reconcile_workload(app: &App, kube: &dyn AppKubeClient) -> Result<Outcome, Error> {
    let kind = ResourceKind::Workload;
    let name = app.name_any();
    let namespace = app_namespace(app)?;
    let desired = build_workload(app)?;

    let observed = kube.get_deployment(&namespace, &name).await?;
    if let Some(found) = &observed {
        let status = AppStatus::from_deployment(found.status.as_ref());
        if app.status.clone().unwrap_or_default() != status {
            kube.update_app_status(&namespace, &name, &status).await?;
            info!(%kind, ready = ?status.ready_replicas, "updated App status from workload");
        }
    }

    match plan(desired, observed.as_ref(), evaluate_workload) {
        Plan::Create(deployment) => {
            kube.create_deployment(&deployment).await?;
            info!(%kind, "created workload");
            Ok(Outcome::Created)
        }
        Plan::Replace(deployment, drift) => {
            info!(
                %kind,
                property = drift.property,
                desired = %drift.desired,
                actual = %drift.actual,
                "updating mismatched values"
            );
            kube.replace_deployment(&deployment).await?;
            Ok(Outcome::Replaced)
        }
        Plan::Keep => {
            debug!(%kind, "workload up to date");
            Ok(Outcome::Unchanged)
        }
    }
}
