//! Identity (ServiceAccount) builder and reconciler
//!
//! There is no evaluator for this kind: once the ServiceAccount exists it is
//! replaced on every pass, so it never settles into a no-op state.

use k8s_openapi::api::core::v1::ServiceAccount;
use kube::ResourceExt;
use tracing::info;

use kappa_common::crd::App;
use kappa_common::kube_utils::{app_namespace, carry_identity, owned_meta};
use kappa_common::Error;

use crate::client::AppKubeClient;
use crate::converge::{Outcome, ResourceKind};

/// Build the desired Identity for an App.
///
/// Labels and annotations come from the App spec only; no `app` label.
pub fn build_identity(app: &App) -> Result<ServiceAccount, Error> {
    Ok(ServiceAccount {
        metadata: owned_meta(
            app,
            app.spec.labels.clone(),
            app.spec.annotations.clone(),
        )?,
        ..Default::default()
    })
}

/// Converge the App's Identity: create when absent, otherwise replace
pub async fn reconcile_identity(app: &App, kube: &dyn AppKubeClient) -> Result<Outcome, Error> {
    let kind = ResourceKind::Identity;
    let name = app.name_any();
    let namespace = app_namespace(app)?;
    let mut desired = build_identity(app)?;

    match kube.get_service_account(&namespace, &name).await? {
        None => {
            kube.create_service_account(&desired).await?;
            info!(%kind, "created identity");
            Ok(Outcome::Created)
        }
        Some(observed) => {
            carry_identity(&mut desired, &observed);
            kube.replace_service_account(&desired).await?;
            info!(%kind, "updated identity");
            Ok(Outcome::Replaced)
        }
    }
}
