//! CRD installation
//!
//! The operator installs its own CRD on startup using server-side apply, so
//! the installed schema always matches the binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use kappa_common::crd::App;

/// CRD definition with name and resource
struct CrdDef {
    name: String,
    crd: CustomResourceDefinition,
}

/// CRDs owned by this operator. The Istio CRDs belong to the mesh install.
fn owned_crds() -> Vec<CrdDef> {
    vec![CrdDef {
        name: App::crd_name().to_string(),
        crd: App::crd(),
    }]
}

/// Render every owned CRD as a multi-document YAML stream
pub fn render_crds() -> anyhow::Result<String> {
    let mut out = String::new();
    for def in owned_crds() {
        let yaml = serde_yaml::to_string(&def.crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?;
        out.push_str("---\n");
        out.push_str(&yaml);
    }
    Ok(out)
}

/// Install or update the App CRD
pub async fn ensure_crds(client: &Client, field_manager: &str) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(field_manager).force();

    for def in owned_crds() {
        tracing::info!(crd = %def.name, "installing CRD");
        crds.patch(&def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_crd_is_rendered() {
        let yaml = render_crds().unwrap();
        assert!(yaml.starts_with("---\n"));
        assert!(yaml.contains("name: apps.kapp.kappa.io"));
        assert!(yaml.contains("kind: App"));
    }

    #[test]
    fn crd_names_match_the_resource() {
        let defs = owned_crds();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "apps.kapp.kappa.io");
        assert_eq!(defs[0].crd.metadata.name.as_deref(), Some("apps.kapp.kappa.io"));
    }
}
