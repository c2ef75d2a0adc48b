//! Controller runner
//!
//! Builds the App controller future. The controller watches Apps plus every
//! derived kind it owns, so an edit to a Deployment, Service, ServiceAccount,
//! VirtualService or DestinationRule re-triggers its App.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use kappa_app::{error_policy, reconcile, AppContext, ControllerConfig};
use kappa_common::crd::{App, DestinationRule, VirtualService};

/// Watcher timeout (seconds), kept below the client read timeout (30s) so
/// idle watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Which namespaces the controller watches
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum WatchScope {
    /// Every namespace
    #[default]
    All,
    /// A single namespace
    Namespace(String),
}

impl WatchScope {
    /// Scope from an optional namespace flag
    pub fn from_namespace(namespace: Option<String>) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self::Namespace(ns),
            _ => Self::All,
        }
    }

    fn api<K>(&self, client: &Client) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + DeserializeOwned,
    {
        match self {
            Self::All => Api::all(client.clone()),
            Self::Namespace(ns) => Api::namespaced(client.clone(), ns),
        }
    }
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the App controller future
pub fn build_app_controller(
    client: Client,
    scope: WatchScope,
    config: ControllerConfig,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let ctx = Arc::new(AppContext::from_client(client.clone(), config));

    tracing::info!(?scope, "- App controller");

    Box::pin(
        Controller::new(scope.api::<App>(&client), watcher_config())
            .owns(scope.api::<ServiceAccount>(&client), watcher_config())
            .owns(scope.api::<Deployment>(&client), watcher_config())
            .owns(scope.api::<Service>(&client), watcher_config())
            .owns(scope.api::<VirtualService>(&client), watcher_config())
            .owns(scope.api::<DestinationRule>(&client), watcher_config())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("App")),
    )
}

/// Helper for logging reconcile results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
