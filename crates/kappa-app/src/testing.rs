//! Test fixtures: sample Apps and an in-memory store that echoes writes back

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use kappa_common::crd::{App, AppSpec, AppStatus, DestinationRule, VirtualService};
use kappa_common::Error;

use crate::client::AppKubeClient;

/// A persisted App in namespace `shop` with every spec field at its default
pub fn sample_app(name: &str) -> App {
    App {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("shop".to_string()),
            uid: Some(format!("{name}-uid")),
            ..Default::default()
        },
        spec: AppSpec::for_image("registry.example.com/web"),
        status: None,
    }
}

/// An API error with the given status code
pub fn api_error(code: u16, reason: &str) -> Error {
    Error::from(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} from test store"),
        reason: reason.to_string(),
        code,
    }))
}

type Key = (String, String);

fn key_of<K: Resource>(obj: &K) -> Key {
    let meta = obj.meta();
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

#[derive(Default)]
struct State {
    service_accounts: BTreeMap<Key, ServiceAccount>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    virtual_services: BTreeMap<Key, VirtualService>,
    destination_rules: BTreeMap<Key, DestinationRule>,
    version: u64,
    creates: usize,
    replaces: usize,
    replaced_kinds: Vec<String>,
    status_updates: usize,
    app_status: Option<serde_json::Value>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

fn insert_new<K: Resource + Clone>(
    map: &mut BTreeMap<Key, K>,
    obj: &K,
    version: String,
) -> Result<K, Error> {
    let key = key_of(obj);
    if map.contains_key(&key) {
        return Err(api_error(409, "AlreadyExists"));
    }
    let mut stored = obj.clone();
    stored.meta_mut().resource_version = Some(version);
    stored.meta_mut().uid = Some(format!("{}-{}-uid", key.0, key.1));
    map.insert(key, stored.clone());
    Ok(stored)
}

fn replace_existing<K: Resource + Clone>(
    map: &mut BTreeMap<Key, K>,
    obj: &K,
    version: String,
) -> Result<(), Error> {
    let key = key_of(obj);
    let Some(current) = map.get(&key) else {
        return Err(api_error(404, "NotFound"));
    };
    if current.meta().resource_version != obj.meta().resource_version {
        return Err(api_error(409, "Conflict"));
    }
    let mut stored = obj.clone();
    stored.meta_mut().resource_version = Some(version);
    map.insert(key, stored);
    Ok(())
}

/// RFC 7386 JSON merge patch: objects merge key by key, `null` removes a key,
/// anything else replaces the target value
fn apply_merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let serde_json::Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    let Some(existing) = target.as_object_mut() else {
        return;
    };
    for (key, value) in fields {
        if value.is_null() {
            existing.remove(key);
        } else {
            apply_merge_patch(
                existing.entry(key.clone()).or_insert(serde_json::Value::Null),
                value,
            );
        }
    }
}

fn lookup<K: Clone>(map: &BTreeMap<Key, K>, namespace: &str, name: &str) -> Option<K> {
    map.get(&(namespace.to_string(), name.to_string())).cloned()
}

/// Store that keeps objects in memory and returns exactly what was written,
/// apart from the store-managed resourceVersion, uid and Service clusterIP.
///
/// Replaces are checked against the stored resourceVersion like the API
/// server does.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful create calls
    pub fn creates(&self) -> usize {
        self.state.lock().unwrap().creates
    }

    /// Kinds replaced so far, in call order
    pub fn replaced_kinds(&self) -> Vec<String> {
        self.state.lock().unwrap().replaced_kinds.clone()
    }

    /// Number of App status writes
    pub fn status_updates(&self) -> usize {
        self.state.lock().unwrap().status_updates
    }

    /// App status as stored after every merge patch so far
    pub fn last_status(&self) -> Option<AppStatus> {
        let s = self.state.lock().unwrap();
        let status = s.app_status.clone()?;
        Some(serde_json::from_value(status).unwrap())
    }

    /// All store-mutating calls so far
    pub fn mutations(&self) -> usize {
        let s = self.state.lock().unwrap();
        s.creates + s.replaces + s.status_updates
    }

    /// Stored Deployment
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        lookup(&self.state.lock().unwrap().deployments, namespace, name)
    }

    /// Stored Service
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        lookup(&self.state.lock().unwrap().services, namespace, name)
    }

    /// Overwrite a stored Deployment as another writer would
    pub fn tamper_deployment(&self, f: impl FnOnce(&mut Deployment)) {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        if let Some(d) = s.deployments.values_mut().next() {
            f(d);
            d.metadata.resource_version = Some(version);
        }
    }

    fn record_replace(s: &mut State, kind: &str) {
        s.replaces += 1;
        s.replaced_kinds.push(kind.to_string());
    }
}

#[async_trait]
impl AppKubeClient for InMemoryStore {
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        Ok(lookup(&self.state.lock().unwrap().service_accounts, namespace, name))
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        insert_new(&mut s.service_accounts, sa, version)?;
        s.creates += 1;
        Ok(())
    }

    async fn replace_service_account(&self, sa: &ServiceAccount) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        replace_existing(&mut s.service_accounts, sa, version)?;
        Self::record_replace(&mut s, "ServiceAccount");
        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(lookup(&self.state.lock().unwrap().deployments, namespace, name))
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        insert_new(&mut s.deployments, deployment, version)?;
        s.creates += 1;
        Ok(())
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        replace_existing(&mut s.deployments, deployment, version)?;
        Self::record_replace(&mut s, "Deployment");
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(lookup(&self.state.lock().unwrap().services, namespace, name))
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        let stored = insert_new(&mut s.services, service, version)?;
        // the API server allocates a cluster IP on create
        let key = key_of(&stored);
        if let Some(spec) = s.services.get_mut(&key).and_then(|svc| svc.spec.as_mut()) {
            spec.cluster_ip = Some("10.96.0.10".to_string());
            spec.cluster_ips = Some(vec!["10.96.0.10".to_string()]);
        }
        s.creates += 1;
        Ok(())
    }

    async fn replace_service(&self, service: &Service) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let key = key_of(service);
        let current_ip = s
            .services
            .get(&key)
            .and_then(|svc| svc.spec.as_ref())
            .and_then(|spec| spec.cluster_ip.clone());
        let written_ip = service.spec.as_ref().and_then(|spec| spec.cluster_ip.clone());
        if current_ip.is_some() && written_ip != current_ip {
            return Err(api_error(422, "Invalid"));
        }
        let version = s.next_version();
        replace_existing(&mut s.services, service, version)?;
        Self::record_replace(&mut s, "Service");
        Ok(())
    }

    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualService>, Error> {
        Ok(lookup(&self.state.lock().unwrap().virtual_services, namespace, name))
    }

    async fn create_virtual_service(&self, vs: &VirtualService) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        insert_new(&mut s.virtual_services, vs, version)?;
        s.creates += 1;
        Ok(())
    }

    async fn replace_virtual_service(&self, vs: &VirtualService) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        replace_existing(&mut s.virtual_services, vs, version)?;
        Self::record_replace(&mut s, "VirtualService");
        Ok(())
    }

    async fn get_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DestinationRule>, Error> {
        Ok(lookup(&self.state.lock().unwrap().destination_rules, namespace, name))
    }

    async fn create_destination_rule(&self, dr: &DestinationRule) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        insert_new(&mut s.destination_rules, dr, version)?;
        s.creates += 1;
        Ok(())
    }

    async fn replace_destination_rule(&self, dr: &DestinationRule) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let version = s.next_version();
        replace_existing(&mut s.destination_rules, dr, version)?;
        Self::record_replace(&mut s, "DestinationRule");
        Ok(())
    }

    async fn update_app_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &AppStatus,
    ) -> Result<(), Error> {
        let patch = status.merge_patch()?;
        let mut s = self.state.lock().unwrap();
        let mut app = serde_json::json!({ "status": s.app_status.clone() });
        apply_merge_patch(&mut app, &patch);
        s.status_updates += 1;
        s.app_status = app.get("status").cloned().filter(|v| !v.is_null());
        Ok(())
    }
}
