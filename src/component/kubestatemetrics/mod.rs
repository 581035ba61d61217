//! kube-state-metrics for seeds (one ManagedResource) and shoots (control plane runtime objects
//! in the seed plus RBAC in the shoot).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::*;

use super::managedresources::{self, create_for_seed_with_labels};
use super::{
    delete_ignore_not_found, deploy_resource_configs, destroy_resource_configs, ClusterType,
    DeployWaiter, Registry, LABEL_CARE_CONDITION_TYPE,
};
use crate::resources::core::OBSERVABILITY_COMPONENTS_HEALTHY;
use crate::utils::version::KubernetesVersion;
use crate::{Error, Result};

mod resources;

pub const MANAGED_RESOURCE_NAME: &str = "kube-state-metrics";
pub const MANAGED_RESOURCE_NAME_SHOOT: &str = "shoot-core-kube-state-metrics";
pub const MANAGED_RESOURCE_NAME_CLUSTER_ROLE: &str = "kube-state-metrics2";

/// Values is a set of configuration values for kube-state-metrics.
#[derive(Clone, Debug)]
pub struct Values {
    /// For seeds, all resources are deployed as part of a ManagedResource. For shoots,
    /// kube-state-metrics runs in the shoot namespace of the seed, so only the RBAC objects go
    /// into a ManagedResource.
    pub cluster_type: ClusterType,
    pub kubernetes_version: KubernetesVersion,
    pub image: String,
    pub priority_class_name: String,
    pub replicas: i32,
    pub is_workerless: bool,
    /// Name of the generic token kubeconfig secret, required for shoots
    pub generic_token_kubeconfig_secret_name: Option<String>,
}

pub struct KubeStateMetrics {
    client: Client,
    namespace: String,
    values: Values,
}

impl KubeStateMetrics {
    pub fn new(client: Client, namespace: impl Into<String>, values: Values) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            values,
        }
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn managed_resource_name(&self) -> &'static str {
        match self.values.cluster_type {
            ClusterType::Seed => MANAGED_RESOURCE_NAME,
            ClusterType::Shoot => MANAGED_RESOURCE_NAME_SHOOT,
        }
    }

    fn custom_resource_state_config() -> Result<String> {
        Ok(serde_yaml::to_string(
            &resources::custom_resource_state_config(),
        )?)
    }

    fn care_labels() -> BTreeMap<String, String> {
        BTreeMap::from([(
            LABEL_CARE_CONDITION_TYPE.into(),
            OBSERVABILITY_COMPONENTS_HEALTHY.into(),
        )])
    }
}

impl DeployWaiter for KubeStateMetrics {
    async fn deploy(&self) -> Result<()> {
        let custom_resource_state_config = Self::custom_resource_state_config()?;

        let mut registry = Registry::new();
        registry.add(&self.cluster_role())?;
        create_for_seed_with_labels(
            &self.client,
            &self.namespace,
            MANAGED_RESOURCE_NAME_CLUSTER_ROLE,
            false,
            Self::care_labels(),
            registry.serialized_objects(),
        )
        .await?;

        let mut generic_token_kubeconfig_secret_name = None;
        if self.values.cluster_type == ClusterType::Shoot {
            let secret_name = self
                .values
                .generic_token_kubeconfig_secret_name
                .as_deref()
                .ok_or_else(|| Error::SecretNotFound(resources::GENERIC_TOKEN_KUBECONFIG.into()))?;
            let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
            if secrets.get_opt(secret_name).await?.is_none() {
                return Err(Error::SecretNotFound(secret_name.into()));
            }
            generic_token_kubeconfig_secret_name = Some(secret_name);

            super::apply(&secrets, &self.shoot_access_secret()).await?;
        }

        info!(
            "Deploying kube-state-metrics for {} in namespace {}",
            self.values.cluster_type.as_str(),
            self.namespace
        );
        deploy_resource_configs(
            &self.client,
            &self.namespace,
            self.values.cluster_type,
            self.managed_resource_name(),
            Self::care_labels(),
            &self.resource_configs(
                generic_token_kubeconfig_secret_name,
                &custom_resource_state_config,
            )?,
        )
        .await
    }

    async fn destroy(&self) -> Result<()> {
        destroy_resource_configs(
            &self.client,
            &self.namespace,
            self.values.cluster_type,
            self.managed_resource_name(),
            &self.resource_configs(None, &Self::custom_resource_state_config()?)?,
        )
        .await?;

        if self.values.cluster_type == ClusterType::Shoot {
            let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
            delete_ignore_not_found(&secrets, resources::SHOOT_ACCESS_SECRET_NAME).await?;
        }
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        managedresources::wait_until_healthy(
            &self.client,
            &self.namespace,
            self.managed_resource_name(),
        )
        .await
    }

    async fn wait_cleanup(&self) -> Result<()> {
        managedresources::wait_until_deleted(
            &self.client,
            &self.namespace,
            self.managed_resource_name(),
        )
        .await
    }
}
