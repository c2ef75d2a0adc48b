//! Endpoint (Service) builder, evaluator and reconciler

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, info};

use kappa_common::crd::App;
use kappa_common::kube_utils::{app_namespace, owned_meta};
use kappa_common::{Error, APP_LABEL};

use crate::client::AppKubeClient;
use crate::converge::{plan, Outcome, Plan, ResourceKind};
use crate::equality::{expect_each_matched, expect_subset, Evaluation};
use crate::workload::app_labels;

/// Fixed plain-HTTP port every Endpoint exposes alongside the App's port
pub const HTTP_PORT: i32 = 80;

fn http_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(target)),
        ..Default::default()
    }
}

/// Build the desired Endpoint for an App.
///
/// Two ports, `http` on the App's port and `http-80` on 80, both targeting
/// the container port.
pub fn build_endpoint(app: &App) -> Result<Service, Error> {
    let name = app.name_any();
    let port = app.spec.container_port(&name)?;

    Ok(Service {
        metadata: owned_meta(app, app_labels(app), app.annotations().clone())?,
        spec: Some(ServiceSpec {
            ports: Some(vec![
                http_port("http", port, port),
                http_port("http-80", HTTP_PORT, port),
            ]),
            selector: Some(BTreeMap::from([(APP_LABEL.to_string(), name)])),
            session_affinity: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    })
}

/// Compare a desired Endpoint against the observed one: labels and
/// annotations as subsets, then every desired port must appear unchanged
/// somewhere in the observed ports.
pub fn evaluate_endpoint(desired: &Service, actual: &Service) -> Evaluation {
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
    let ports = |s: &Service| {
        s.spec
            .as_ref()
            .and_then(|spec| spec.ports.clone())
            .unwrap_or_default()
    };
    expect_each_matched("ports", &ports(desired), &ports(actual), |d, a| d == a)
}

/// Keep the allocated cluster IPs: they are immutable once assigned
fn carry_cluster_ips(desired: &mut Service, observed: &Service) {
    let (Some(spec), Some(found)) = (desired.spec.as_mut(), observed.spec.as_ref()) else {
        return;
    };
    spec.cluster_ip = found.cluster_ip.clone();
    spec.cluster_ips = found.cluster_ips.clone();
}

/// Converge the App's Endpoint
pub async fn reconcile_endpoint(app: &App, kube: &dyn AppKubeClient) -> Result<Outcome, Error> {
    let kind = ResourceKind::Endpoint;
    let name = app.name_any();
    let namespace = app_namespace(app)?;
    let desired = build_endpoint(app)?;

    let observed = kube.get_service(&namespace, &name).await?;

    match plan(desired, observed.as_ref(), evaluate_endpoint) {
        Plan::Create(service) => {
            kube.create_service(&service).await?;
            info!(%kind, "created endpoint");
            Ok(Outcome::Created)
        }
        Plan::Replace(mut service, drift) => {
            if let Some(found) = &observed {
                carry_cluster_ips(&mut service, found);
            }
            info!(
                %kind,
                property = drift.property,
                desired = %drift.desired,
                actual = %drift.actual,
                "updating mismatched values"
            );
            kube.replace_service(&service).await?;
            Ok(Outcome::Replaced)
        }
        Plan::Keep => {
            debug!(%kind, "endpoint up to date");
            Ok(Outcome::Unchanged)
        }
    }
}
