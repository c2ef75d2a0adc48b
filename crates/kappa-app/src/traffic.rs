//! TrafficPolicy (Istio DestinationRule) builder and reconciler

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, info};

use kappa_common::crd::{
    App, ClientTlsSettings, DestinationRule, DestinationRuleSpec, LoadBalancerSettings, SimpleLb,
    TlsMode, TrafficPolicy,
};
use kappa_common::kube_utils::{app_namespace, owned_meta, service_host};
use kappa_common::Error;

use crate::client::AppKubeClient;
use crate::converge::{plan, Outcome, Plan, ResourceKind};
use crate::equality::{expect_eq, Evaluation};

/// Client TLS mode towards the App: Istio mutual TLS unless disabled
pub fn tls_mode(app: &App) -> TlsMode {
    if app.spec.disable_mtls {
        TlsMode::Disable
    } else {
        TlsMode::IstioMutual
    }
}

/// Build the desired TrafficPolicy for an App
pub fn build_traffic_policy(app: &App) -> Result<DestinationRule, Error> {
    let name = app.name_any();
    let namespace = app_namespace(app)?;

    let mut dr = DestinationRule::new(
        &name,
        DestinationRuleSpec {
            host: service_host(&name, &namespace),
            traffic_policy: Some(TrafficPolicy {
                tls: Some(ClientTlsSettings {
                    mode: tls_mode(app),
                }),
                load_balancer: Some(LoadBalancerSettings {
                    simple: Some(SimpleLb::RoundRobin),
                }),
            }),
        },
    );
    dr.metadata = owned_meta(app, app.labels().clone(), BTreeMap::new())?;
    Ok(dr)
}

/// TrafficPolicy bodies must be equal
pub fn evaluate_traffic_policy(desired: &DestinationRule, actual: &DestinationRule) -> Evaluation {
    expect_eq("spec", &desired.spec, &actual.spec)
}

/// Converge the App's TrafficPolicy
pub async fn reconcile_traffic_policy(
    app: &App,
    kube: &dyn AppKubeClient,
) -> Result<Outcome, Error> {
    let kind = ResourceKind::TrafficPolicy;
    let name = app.name_any();
    let namespace = app_namespace(app)?;
    let desired = build_traffic_policy(app)?;

    let observed = kube.get_destination_rule(&namespace, &name).await?;
    match plan(desired, observed.as_ref(), evaluate_traffic_policy) {
        Plan::Create(dr) => {
            kube.create_destination_rule(&dr).await?;
            info!(%kind, "created traffic policy");
            Ok(Outcome::Created)
        }
        Plan::Replace(dr, drift) => {
            info!(
                %kind,
                property = drift.property,
                desired = %drift.desired,
                actual = %drift.actual,
                "updating mismatched values"
            );
            kube.replace_destination_rule(&dr).await?;
            Ok(Outcome::Replaced)
        }
        Plan::Keep => {
            debug!(%kind, "traffic policy up to date");
            Ok(Outcome::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAppKubeClient;
    use crate::testing::sample_app;

    fn mode(dr: &DestinationRule) -> TlsMode {
        dr.spec
            .traffic_policy
            .as_ref()
            .and_then(|p| p.tls.as_ref())
            .map(|t| t.mode)
            .unwrap()
    }

    #[test]
    fn mutual_tls_unless_disabled() {
        let mut app = sample_app("web");
        assert_eq!(mode(&build_traffic_policy(&app).unwrap()), TlsMode::IstioMutual);

        app.spec.disable_mtls = true;
        assert_eq!(mode(&build_traffic_policy(&app).unwrap()), TlsMode::Disable);
    }

    #[test]
    fn round_robin_to_the_endpoint_host() {
        let dr = build_traffic_policy(&sample_app("web")).unwrap();
        assert_eq!(dr.spec.host, "web.shop.svc.cluster.local");
        let lb = dr.spec.traffic_policy.unwrap().load_balancer.unwrap();
        assert_eq!(lb.simple, Some(SimpleLb::RoundRobin));
    }

    /// Story: flipping the mTLS flag replaces the DestinationRule
    #[tokio::test]
    async fn story_disabling_mtls_replaces_the_policy() {
        let before = sample_app("web");
        let mut observed = build_traffic_policy(&before).unwrap();
        observed.metadata.resource_version = Some("12".to_string());

        let mut after = before.clone();
        after.spec.disable_mtls = true;

        let mut mock = MockAppKubeClient::new();
        mock.expect_get_destination_rule()
            .returning(move |_, _| Ok(Some(observed.clone())));
        mock.expect_replace_destination_rule()
            .times(1)
            .returning(|_| Ok(()));

        assert_eq!(
            reconcile_traffic_policy(&after, &mock).await.unwrap(),
            Outcome::Replaced
        );
    }

    #[tokio::test]
    async fn absent_policy_is_created() {
        let app = sample_app("web");
        let mut mock = MockAppKubeClient::new();
        mock.expect_get_destination_rule().returning(|_, _| Ok(None));
        mock.expect_create_destination_rule()
            .times(1)
            .returning(|_| Ok(()));

        assert_eq!(
            reconcile_traffic_policy(&app, &mock).await.unwrap(),
            Outcome::Created
        );
    }
}
