//! Sequencing of the seed-side components of one shoot.

use std::sync::Arc;

use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{Client, ResourceExt};
use tracing::*;

use crate::component::kubestatemetrics::{self, KubeStateMetrics};
use crate::component::operatorgrafana::{self, OperatorGrafana};
use crate::component::vali::{self, Vali};
use crate::component::{delete_objects, ClusterType, DeployWaiter, ObjectKey};
use crate::config::Config;
use crate::images::{
    ImageVector, IMAGE_NAME_GRAFANA, IMAGE_NAME_KUBE_STATE_METRICS, IMAGE_NAME_VALI,
};
use crate::migration::{rename_loki_pvc_to_vali_pvc, MigrationOptions};
use crate::resources::shoots::{Shoot, PURPOSE_TESTING};
use crate::utils::version::KubernetesVersion;
use crate::{Error, Result};

pub const PRIORITY_CLASS_SHOOT_CONTROL_PLANE_100: &str = "gardener-system-100";
pub const SECRET_NAME_GENERIC_TOKEN_KUBECONFIG: &str = "generic-token-kubeconfig";
const VALI_STORAGE: &str = "30Gi";

/// Network policies of the former Vali chart, superseded by the shoot namespace defaults
const LEGACY_VALI_NETWORK_POLICIES: &[&str] = &[
    "allow-from-prometheus-to-vali-telegraf",
    "allow-to-vali",
    "allow-vali",
];

/// Operates the control plane components of a single shoot in its seed namespace
pub struct Botanist {
    client: Client,
    config: Arc<Config>,
    image_vector: Arc<ImageVector>,
    shoot: Arc<Shoot>,
    namespace: String,
    kubernetes_version: KubernetesVersion,
    migration: MigrationOptions,
}

impl Botanist {
    pub fn new(
        client: Client,
        config: Arc<Config>,
        image_vector: Arc<ImageVector>,
        shoot: Arc<Shoot>,
    ) -> Result<Self> {
        let namespace = shoot
            .seed_namespace()
            .ok_or_else(|| Error::MissingTechnicalId(shoot.name_any()))?
            .to_string();
        let kubernetes_version = shoot.spec.kubernetes.version.parse()?;
        Ok(Self {
            client,
            config,
            image_vector,
            shoot,
            namespace,
            kubernetes_version,
            migration: MigrationOptions::default(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn image(&self, name: &str) -> Result<String> {
        Ok(self
            .image_vector
            .find_image(name, None, Some(self.kubernetes_version))?
            .image())
    }

    /// Testing shoots are not monitored
    pub fn monitoring_enabled(&self) -> bool {
        self.shoot.purpose() != PURPOSE_TESTING
    }

    pub fn default_kube_state_metrics(&self) -> Result<KubeStateMetrics> {
        Ok(KubeStateMetrics::new(
            self.client.clone(),
            &self.namespace,
            kubestatemetrics::Values {
                cluster_type: ClusterType::Shoot,
                kubernetes_version: self.kubernetes_version,
                image: self.image(IMAGE_NAME_KUBE_STATE_METRICS)?,
                priority_class_name: PRIORITY_CLASS_SHOOT_CONTROL_PLANE_100.into(),
                replicas: self.shoot.get_replicas(1),
                is_workerless: self.shoot.is_workerless(),
                generic_token_kubeconfig_secret_name: Some(
                    SECRET_NAME_GENERIC_TOKEN_KUBECONFIG.into(),
                ),
            },
        ))
    }

    /// Deploys kube-state-metrics, or removes it when the shoot is not monitored
    pub async fn deploy_kube_state_metrics(&self) -> Result<()> {
        let ksm = self.default_kube_state_metrics()?;
        if !self.monitoring_enabled() {
            return ksm.destroy().await;
        }
        ksm.deploy().await
    }

    pub fn default_operator_grafana(&self) -> Result<OperatorGrafana> {
        Ok(OperatorGrafana::new(
            self.client.clone(),
            &self.namespace,
            operatorgrafana::Values {
                enabled: true,
                image: self.image(IMAGE_NAME_GRAFANA)?,
            },
        ))
    }

    pub async fn deploy_operator_grafana(&self) -> Result<()> {
        self.default_operator_grafana()?.deploy().await
    }

    fn vali_values(&self) -> Result<vali::Values> {
        Ok(vali::Values {
            image: self.image(IMAGE_NAME_VALI)?,
            replicas: self.shoot.get_replicas(1),
            priority_class_name: PRIORITY_CLASS_SHOOT_CONTROL_PLANE_100.into(),
            storage: Quantity(VALI_STORAGE.into()),
        })
    }

    async fn destroy_shoot_logging_stack(&self) -> Result<()> {
        vali::delete_shoot_node_logging(&self.client, &self.namespace).await?;
        vali::delete_vali(&self.client, &self.namespace).await
    }

    /// Brings the shoot's logging stack in line with the configuration.
    ///
    /// A Loki stack left over from earlier versions is removed first and its volume handed to
    /// Vali, so logs survive the switch.
    pub async fn deploy_seed_logging(&self) -> Result<()> {
        let purpose = self.shoot.purpose();
        if !self.config.shoot_control_plane_logging_enabled(purpose) {
            info!("Control plane logging disabled for {}", self.namespace);
            return self.destroy_shoot_logging_stack().await;
        }

        vali::delete_shoot_node_logging(&self.client, &self.namespace).await?;
        vali::delete_loki_retain_pvc(&self.client, &self.namespace).await?;
        rename_loki_pvc_to_vali_pvc(&self.client, &self.namespace, &self.migration).await?;

        if !self.config.vali_enabled {
            // node logging runs inside the Vali pod
            return self.destroy_shoot_logging_stack().await;
        }

        if !self.config.shoot_node_logging_enabled(purpose) {
            vali::delete_shoot_node_logging(&self.client, &self.namespace).await?;
        }

        Vali::new(self.client.clone(), &self.namespace, self.vali_values()?)
            .deploy()
            .await?;

        let keys: Vec<ObjectKey> = LEGACY_VALI_NETWORK_POLICIES
            .iter()
            .map(|name| ObjectKey::namespaced::<NetworkPolicy>(&self.namespace, name))
            .collect();
        delete_objects(&self.client, &keys).await
    }

    /// Removes every component deployed by this botanist
    pub async fn destroy(&self) -> Result<()> {
        let ksm = self.default_kube_state_metrics()?;
        let grafana = self.default_operator_grafana()?;
        ksm.destroy().await?;
        grafana.destroy().await?;
        self.destroy_shoot_logging_stack().await?;
        ksm.wait_cleanup().await?;
        grafana.wait_cleanup().await
    }
}
