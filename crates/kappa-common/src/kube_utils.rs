//! Shared Kubernetes helpers for objects derived from an App

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::App;
use crate::Error;

/// In-cluster DNS suffix used to address an App's Endpoint
pub const CLUSTER_DOMAIN: &str = "svc.cluster.local";

/// Fully-qualified in-cluster host for a service
pub fn service_host(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}.{CLUSTER_DOMAIN}")
}

/// Namespace of an App; Apps are namespaced so a missing one is a bug upstream
pub fn app_namespace(app: &App) -> Result<String, Error> {
    app.namespace().ok_or_else(|| {
        Error::validation_for_field(app.name_any(), "metadata.namespace", "App has no namespace")
    })
}

/// Metadata for an object derived from `app`: same name and namespace,
/// the given labels and annotations, and a controller owner reference so
/// the object is garbage-collected with the App.
///
/// The owner reference is omitted when the App has not been persisted yet
/// (no uid), which only happens in tests.
pub fn owned_meta(
    app: &App,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(app.name_any()),
        namespace: Some(app_namespace(app)?),
        labels: non_empty(labels),
        annotations: non_empty(annotations),
        owner_references: app.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    })
}

/// Copy the server-assigned identity (resourceVersion, uid) of `observed`
/// onto `desired`, so a full replace is accepted by optimistic concurrency.
pub fn carry_identity<K: Resource>(desired: &mut K, observed: &K) {
    let from = observed.meta();
    let meta = desired.meta_mut();
    meta.resource_version = from.resource_version.clone();
    meta.uid = from.uid.clone();
}

/// `None` for an empty map, so builders emit the same shape the API server
/// echoes back for unset fields
pub fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Check if a kube error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
