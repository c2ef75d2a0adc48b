//! App controller implementation
//!
//! One reconcile pass converges the five kinds derived from an App in a fixed
//! order: Identity, Workload, Endpoint, RoutingRule, TrafficPolicy. The pass
//! stops at the first error, leaving earlier writes in place; every step is
//! idempotent, so the next pass picks up where this one stopped.
//!
//! A pass that creates an object returns early and asks to be requeued soon,
//! so later kinds are built against a freshly observed state.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

use kappa_common::crd::App;
use kappa_common::{Error, DEFAULT_FIELD_MANAGER};

use crate::client::{AppKubeClient, AppKubeClientImpl};
use crate::converge::{Outcome, ResourceKind};
use crate::endpoint::reconcile_endpoint;
use crate::identity::reconcile_identity;
use crate::routing::reconcile_routing_rule;
use crate::traffic::reconcile_traffic_policy;
use crate::workload::reconcile_workload;

/// Default delay before re-running a pass that created an object
pub const DEFAULT_CREATED_REQUEUE: Duration = Duration::from_secs(1);

/// Default delay before retrying a pass that failed transiently
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Tunables for the App controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Field manager recorded on writes
    pub field_manager: String,
    /// Requeue delay after a pass that created an object
    pub created_requeue: Duration,
    /// Requeue delay after a transient failure
    pub error_requeue: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            created_requeue: DEFAULT_CREATED_REQUEUE,
            error_requeue: DEFAULT_ERROR_REQUEUE,
        }
    }
}

/// Controller context shared by every reconcile call
pub struct AppContext {
    /// Store used to read and write derived objects
    pub kube: Arc<dyn AppKubeClient>,
    /// Controller tunables
    pub config: ControllerConfig,
}

impl AppContext {
    /// Create a new AppContext with the given store
    pub fn new(kube: Arc<dyn AppKubeClient>, config: ControllerConfig) -> Self {
        Self { kube, config }
    }

    /// Create a new AppContext backed by the Kubernetes API
    pub fn from_client(client: Client, config: ControllerConfig) -> Self {
        let kube = AppKubeClientImpl::with_field_manager(client, config.field_manager.clone());
        Self::new(Arc::new(kube), config)
    }

    /// Create a context for testing with default tunables
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn AppKubeClient>) -> Self {
        Self::new(kube, ControllerConfig::default())
    }
}

/// Run the five per-kind reconcilers in order.
///
/// Returns the kind that was created, if any; creation ends the pass.
pub async fn converge_app(
    app: &App,
    kube: &dyn AppKubeClient,
) -> Result<Option<ResourceKind>, Error> {
    if reconcile_identity(app, kube).await? == Outcome::Created {
        return Ok(Some(ResourceKind::Identity));
    }
    if reconcile_workload(app, kube).await? == Outcome::Created {
        return Ok(Some(ResourceKind::Workload));
    }
    if reconcile_endpoint(app, kube).await? == Outcome::Created {
        return Ok(Some(ResourceKind::Endpoint));
    }
    if reconcile_routing_rule(app, kube).await? == Outcome::Created {
        return Ok(Some(ResourceKind::RoutingRule));
    }
    if reconcile_traffic_policy(app, kube).await? == Outcome::Created {
        return Ok(Some(ResourceKind::TrafficPolicy));
    }
    Ok(None)
}

/// Reconcile an App
///
/// A pass that created an object requeues after `created_requeue`; a pass
/// that completed waits for the next change to the App or an owned object.
#[instrument(skip(app, ctx), fields(app = %app.name_any(), namespace = ?app.namespace()))]
pub async fn reconcile(app: Arc<App>, ctx: Arc<AppContext>) -> Result<Action, Error> {
    debug!("reconciling app");

    match converge_app(&app, ctx.kube.as_ref()).await? {
        Some(kind) => {
            info!(%kind, "created derived object, requeueing");
            Ok(Action::requeue(ctx.config.created_requeue))
        }
        None => {
            debug!("app converged");
            Ok(Action::await_change())
        }
    }
}

/// Error policy for the controller
///
/// Transient errors are retried after `error_requeue`; fatal ones wait for
/// the App to change.
pub fn error_policy(app: Arc<App>, error: &Error, ctx: Arc<AppContext>) -> Action {
    error!(
        ?error,
        app = %app.name_any(),
        class = ?error.class(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.config.error_requeue)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAppKubeClient;
    use crate::testing::{api_error, sample_app, InMemoryStore};
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};
    use kappa_common::crd::AppStatus;
    use std::collections::BTreeMap;

    fn store_context() -> (Arc<InMemoryStore>, Arc<AppContext>) {
        let store = Arc::new(InMemoryStore::new());
        let ctx = Arc::new(AppContext::for_testing(store.clone()));
        (store, ctx)
    }

    /// Reconcile until a pass completes without creating anything
    async fn run_until_settled(
        app: &mut App,
        ctx: &Arc<AppContext>,
        store: &InMemoryStore,
    ) -> usize {
        for pass in 1..=10 {
            let action = reconcile(Arc::new(app.clone()), ctx.clone()).await.unwrap();
            // the watch would deliver the App with its updated status
            if let Some(status) = store.last_status() {
                app.status = Some(status);
            }
            if action == Action::await_change() {
                return pass;
            }
            assert_eq!(action, Action::requeue(DEFAULT_CREATED_REQUEUE));
        }
        panic!("App did not settle within 10 passes");
    }

    // =========================================================================
    // Story: a new App converges
    // =========================================================================

    /// Story: each pass creates one kind and requeues, then the App settles
    #[tokio::test]
    async fn story_new_app_converges_one_kind_per_pass() {
        let (store, ctx) = store_context();
        let mut app = sample_app("web");

        let passes = run_until_settled(&mut app, &ctx, &store).await;
        assert_eq!(passes, 6, "five creating passes then one settled pass");
        assert_eq!(store.creates(), 5);
        assert_eq!(store.status_updates(), 0);

        // every pass after the first rewrote the Identity, nothing else
        assert_eq!(store.replaced_kinds(), vec!["ServiceAccount"; 5]);
    }

    /// Story: reconciling a converged App writes nothing but the Identity
    #[tokio::test]
    async fn story_converged_app_is_a_fixed_point() {
        let (store, ctx) = store_context();
        let mut app = sample_app("web");
        run_until_settled(&mut app, &ctx, &store).await;

        let before = store.mutations();
        let action = reconcile(Arc::new(app.clone()), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(store.mutations() - before, 1);
        assert_eq!(
            store.replaced_kinds().last().map(String::as_str),
            Some("ServiceAccount")
        );
    }

    /// Story: a spec change reaches the Workload and Endpoint in one pass
    #[tokio::test]
    async fn story_port_change_is_replaced_in_place() {
        let (store, ctx) = store_context();
        let mut app = sample_app("web");
        run_until_settled(&mut app, &ctx, &store).await;
        let creates = store.creates();

        app.spec.port = Some(9090);
        let action = reconcile(Arc::new(app.clone()), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(store.creates(), creates);

        let kinds = store.replaced_kinds();
        let last_pass = &kinds[kinds.len() - 3..];
        assert_eq!(last_pass, ["ServiceAccount", "Deployment", "Service"]);

        let svc = store.service("shop", "web").unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.ports.unwrap()[0].port, 9090);
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.10"));
    }

    /// Story: another writer scales the Deployment; the next pass restores it
    #[tokio::test]
    async fn story_out_of_band_edit_is_reverted() {
        let (store, ctx) = store_context();
        let mut app = sample_app("web");
        app.spec.instances = 3;
        run_until_settled(&mut app, &ctx, &store).await;

        store.tamper_deployment(|d| {
            d.spec.as_mut().unwrap().replicas = Some(10);
            d.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .insert("edited-by".to_string(), "hand".to_string());
        });
        reconcile(Arc::new(app.clone()), ctx.clone()).await.unwrap();

        let deployment = store.deployment("shop", "web").unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(3));
        // whole-object replace drops fields the evaluator ignores
        assert!(!deployment
            .metadata
            .labels
            .unwrap()
            .contains_key("edited-by"));
    }

    fn rollout(
        unavailable: Option<i32>,
        conditions: Option<Vec<DeploymentCondition>>,
    ) -> DeploymentStatus {
        DeploymentStatus {
            observed_generation: Some(2),
            replicas: Some(2),
            updated_replicas: Some(2),
            ready_replicas: Some(2 - unavailable.unwrap_or(0)),
            unavailable_replicas: unavailable,
            conditions,
            ..Default::default()
        }
    }

    /// Story: status follows a rollout to completion, then stops being written
    #[tokio::test]
    async fn story_status_tracks_rollout_then_settles() {
        let (store, ctx) = store_context();
        let mut app = sample_app("web");
        app.spec.instances = 2;
        run_until_settled(&mut app, &ctx, &store).await;

        let rolling = rollout(
            Some(1),
            Some(vec![DeploymentCondition {
                type_: "Available".to_string(),
                status: "False".to_string(),
                reason: Some("MinimumReplicasUnavailable".to_string()),
                ..Default::default()
            }]),
        );
        store.tamper_deployment(|d| d.status = Some(rolling.clone()));
        reconcile(Arc::new(app.clone()), ctx.clone()).await.unwrap();
        app.status = store.last_status();
        assert_eq!(app.status, Some(AppStatus::from_deployment(Some(&rolling))));
        assert_eq!(app.status.as_ref().unwrap().unavailable_replicas, Some(1));

        // the finished rollout drops the unavailable count and the condition
        let finished = rollout(None, None);
        store.tamper_deployment(|d| d.status = Some(finished.clone()));
        reconcile(Arc::new(app.clone()), ctx.clone()).await.unwrap();
        app.status = store.last_status();
        let mirrored = app.status.clone().unwrap();
        assert_eq!(mirrored, AppStatus::from_deployment(Some(&finished)));
        assert_eq!(mirrored.unavailable_replicas, None);
        assert!(mirrored.conditions.is_empty());

        let writes = store.status_updates();
        let action = reconcile(Arc::new(app.clone()), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(store.status_updates(), writes);
    }

    // =========================================================================
    // Story: failures stop the pass
    // =========================================================================

    #[tokio::test]
    async fn story_read_error_aborts_before_later_kinds() {
        let mut mock = MockAppKubeClient::new();
        mock.expect_get_service_account()
            .returning(|_, _| Ok(Some(Default::default())));
        mock.expect_replace_service_account().returning(|_| Ok(()));
        mock.expect_get_deployment()
            .returning(|_, _| Err(api_error(500, "InternalError")));
        mock.expect_get_service().never();
        mock.expect_get_virtual_service().never();
        mock.expect_get_destination_rule().never();

        let ctx = Arc::new(AppContext::for_testing(Arc::new(mock)));
        let app = Arc::new(sample_app("web"));
        let err = reconcile(app.clone(), ctx.clone()).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(
            error_policy(app, &err, ctx),
            Action::requeue(DEFAULT_ERROR_REQUEUE)
        );
    }

    #[tokio::test]
    async fn story_creation_returns_early() {
        let mut mock = MockAppKubeClient::new();
        mock.expect_get_service_account().returning(|_, _| Ok(None));
        mock.expect_create_service_account().returning(|_| Ok(()));
        mock.expect_get_deployment().never();

        let ctx = Arc::new(AppContext::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(sample_app("web")), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn story_null_port_is_fatal() {
        let (_, ctx) = store_context();
        let mut app = sample_app("web");
        app.spec.port = None;
        let app = Arc::new(app);

        // the Identity does not need a port, the Workload does
        let action = reconcile(app.clone(), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_CREATED_REQUEUE));
        let err = reconcile(app.clone(), ctx.clone()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(error_policy(app, &err, ctx), Action::await_change());
    }

    #[test]
    fn configured_delays_are_used() {
        let config = ControllerConfig {
            error_requeue: Duration::from_secs(5),
            ..Default::default()
        };
        let ctx = Arc::new(AppContext::new(Arc::new(InMemoryStore::new()), config));
        let err = api_error(409, "Conflict");
        assert_eq!(
            error_policy(Arc::new(sample_app("web")), &err, ctx),
            Action::requeue(Duration::from_secs(5))
        );
    }
}
