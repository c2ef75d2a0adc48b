//! Store contract used by the reconcilers
//!
//! The reconcilers only read, create and replace whole objects, plus one
//! status write on the App. [`AppKubeClient`] is that contract; the
//! production implementation wraps typed `kube::Api` handles.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use kappa_common::crd::{App, AppStatus, DestinationRule, VirtualService};
use kappa_common::{Error, DEFAULT_FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations for App reconciliation
///
/// `get_*` map NotFound to `Ok(None)`; every other failure is returned.
/// `replace_*` expect the object to carry the observed resourceVersion.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppKubeClient: Send + Sync {
    /// Get the ServiceAccount for an App
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error>;
    /// Create a ServiceAccount
    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), Error>;
    /// Replace a ServiceAccount
    async fn replace_service_account(&self, sa: &ServiceAccount) -> Result<(), Error>;

    /// Get the Deployment for an App
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;
    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error>;
    /// Replace a Deployment
    async fn replace_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Get the Service for an App
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;
    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<(), Error>;
    /// Replace a Service
    async fn replace_service(&self, service: &Service) -> Result<(), Error>;

    /// Get the VirtualService for an App
    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualService>, Error>;
    /// Create a VirtualService
    async fn create_virtual_service(&self, vs: &VirtualService) -> Result<(), Error>;
    /// Replace a VirtualService
    async fn replace_virtual_service(&self, vs: &VirtualService) -> Result<(), Error>;

    /// Get the DestinationRule for an App
    async fn get_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DestinationRule>, Error>;
    /// Create a DestinationRule
    async fn create_destination_rule(&self, dr: &DestinationRule) -> Result<(), Error>;
    /// Replace a DestinationRule
    async fn replace_destination_rule(&self, dr: &DestinationRule) -> Result<(), Error>;

    /// Set the App's status sub-resource to exactly `status`; fields unset
    /// in `status` are cleared
    async fn update_app_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AppStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct AppKubeClientImpl {
    client: Client,
    field_manager: String,
}

impl AppKubeClientImpl {
    /// Create a new AppKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self::with_field_manager(client, DEFAULT_FIELD_MANAGER)
    }

    /// Create a client that records writes under `field_manager`
    pub fn with_field_manager(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }

    async fn get<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, Error>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<(), Error>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let namespace = object_namespace(obj)?;
        self.api::<K>(&namespace)
            .create(&self.post_params(), obj)
            .await?;
        Ok(())
    }

    async fn replace<K>(&self, obj: &K) -> Result<(), Error>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let namespace = object_namespace(obj)?;
        let name = obj.meta().name.clone().ok_or_else(|| {
            Error::internal_with_context("replace", "desired object has no name")
        })?;
        self.api::<K>(&namespace)
            .replace(&name, &self.post_params(), obj)
            .await?;
        Ok(())
    }
}

fn object_namespace<K: kube::Resource>(obj: &K) -> Result<String, Error> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::internal_with_context("store", "desired object has no namespace"))
}

#[async_trait]
impl AppKubeClient for AppKubeClientImpl {
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        self.get(namespace, name).await
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> Result<(), Error> {
        self.create(sa).await
    }

    async fn replace_service_account(&self, sa: &ServiceAccount) -> Result<(), Error> {
        self.replace(sa).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        self.get(namespace, name).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.create(deployment).await
    }

    async fn replace_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.replace(deployment).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        self.get(namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        self.create(service).await
    }

    async fn replace_service(&self, service: &Service) -> Result<(), Error> {
        self.replace(service).await
    }

    async fn get_virtual_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualService>, Error> {
        self.get(namespace, name).await
    }

    async fn create_virtual_service(&self, vs: &VirtualService) -> Result<(), Error> {
        self.create(vs).await
    }

    async fn replace_virtual_service(&self, vs: &VirtualService) -> Result<(), Error> {
        self.replace(vs).await
    }

    async fn get_destination_rule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DestinationRule>, Error> {
        self.get(namespace, name).await
    }

    async fn create_destination_rule(&self, dr: &DestinationRule) -> Result<(), Error> {
        self.create(dr).await
    }

    async fn replace_destination_rule(&self, dr: &DestinationRule) -> Result<(), Error> {
        self.replace(dr).await
    }

    async fn update_app_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AppStatus,
    ) -> Result<(), Error> {
        let api: Api<App> = self.api(namespace);
        let patch = status.merge_patch()?;
        api.patch_status(
            name,
            &PatchParams {
                field_manager: Some(self.field_manager.clone()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}
