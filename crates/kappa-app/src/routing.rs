//! RoutingRule (Istio VirtualService) builder and reconciler
//!
//! One catch-all HTTP route to the App's Endpoint on port 80, with HSTS on
//! every response, server identification headers stripped, and a permissive
//! CORS policy. Nothing here is configurable from the App spec.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, info};

use kappa_common::crd::{
    App, CorsPolicy, Destination, HeaderOperations, Headers, HttpMatchRequest, HttpRoute,
    HttpRouteDestination, PortSelector, StringMatch, VirtualService, VirtualServiceSpec,
};
use kappa_common::kube_utils::{app_namespace, owned_meta, service_host};
use kappa_common::Error;

use crate::client::AppKubeClient;
use crate::converge::{plan, Outcome, Plan, ResourceKind};
use crate::endpoint::HTTP_PORT;
use crate::equality::{expect_eq, Evaluation};

/// HSTS header set on every response
pub const HSTS_HEADER: (&str, &str) = ("Strict-Transport-Security", "max-age=31536000");

/// Response headers removed so the backend is not fingerprinted
pub const REMOVED_RESPONSE_HEADERS: [&str; 2] = ["Server", "server"];

/// Methods allowed by the CORS policy
pub const CORS_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Build the desired RoutingRule for an App
pub fn build_routing_rule(app: &App) -> Result<VirtualService, Error> {
    let name = app.name_any();
    let namespace = app_namespace(app)?;

    let route = HttpRoute {
        match_: vec![HttpMatchRequest {
            uri: Some(StringMatch::prefix("/")),
        }],
        route: vec![HttpRouteDestination {
            destination: Destination {
                host: service_host(&name, &namespace),
                port: Some(PortSelector {
                    number: HTTP_PORT as u32,
                }),
            },
            weight: None,
        }],
        headers: Some(Headers {
            request: None,
            response: Some(HeaderOperations {
                set: BTreeMap::from([(HSTS_HEADER.0.to_string(), HSTS_HEADER.1.to_string())]),
                add: BTreeMap::new(),
                remove: strings(REMOVED_RESPONSE_HEADERS),
            }),
        }),
        cors_policy: Some(CorsPolicy {
            allow_origins: vec![StringMatch::regex(".*")],
            allow_methods: strings(CORS_METHODS),
            allow_headers: vec!["*".to_string()],
            ..Default::default()
        }),
    };

    let mut vs = VirtualService::new(
        &name,
        VirtualServiceSpec {
            http: vec![route],
            ..Default::default()
        },
    );
    vs.metadata = owned_meta(app, app.labels().clone(), BTreeMap::new())?;
    Ok(vs)
}

/// RoutingRule bodies must be equal
pub fn evaluate_routing_rule(desired: &VirtualService, actual: &VirtualService) -> Evaluation {
    expect_eq("spec", &desired.spec, &actual.spec)
}

/// Converge the App's RoutingRule
pub async fn reconcile_routing_rule(
    app: &App,
    kube: &dyn AppKubeClient,
) -> Result<Outcome, Error> {
    let kind = ResourceKind::RoutingRule;
    let name = app.name_any();
    let namespace = app_namespace(app)?;
    let desired = build_routing_rule(app)?;

    let observed = kube.get_virtual_service(&namespace, &name).await?;
    match plan(desired, observed.as_ref(), evaluate_routing_rule) {
        Plan::Create(vs) => {
            kube.create_virtual_service(&vs).await?;
            info!(%kind, "created routing rule");
            Ok(Outcome::Created)
        }
        Plan::Replace(vs, drift) => {
            info!(
                %kind,
                property = drift.property,
                desired = %drift.desired,
                actual = %drift.actual,
                "updating mismatched values"
            );
            kube.replace_virtual_service(&vs).await?;
            Ok(Outcome::Replaced)
        }
        Plan::Keep => {
            debug!(%kind, "routing rule up to date");
            Ok(Outcome::Unchanged)
        }
    }
}
