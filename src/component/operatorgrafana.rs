use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;

use super::managedresources;
use super::{
    deploy_resource_configs, destroy_resource_configs, label_selector, object_meta, ClusterType,
    DeployWaiter, ResourceConfig, LABEL_APP, LABEL_GARDEN_ROLE,
};
use crate::Result;

pub const MANAGED_RESOURCE_NAME: &str = "operatorgrafana";
pub const DEFAULT_IMAGE: &str = "grafana/grafana";

const NAME: &str = "operatorgrafana";
const PORT: i32 = 3000;

#[derive(Clone, Debug)]
pub struct Values {
    pub enabled: bool,
    pub image: String,
}

impl Default for Values {
    fn default() -> Self {
        Self {
            enabled: true,
            image: DEFAULT_IMAGE.into(),
        }
    }
}

/// Grafana for operators, running next to a shoot's control plane
pub struct OperatorGrafana {
    client: Client,
    namespace: String,
    values: Values,
}

impl OperatorGrafana {
    pub fn new(client: Client, namespace: impl Into<String>, values: Values) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            values,
        }
    }

    pub fn resource_configs(&self) -> Result<Vec<ResourceConfig>> {
        Ok(vec![ResourceConfig::application(&self.deployment())?])
    }

    fn app_labels() -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_APP.into(), NAME.into())])
    }

    fn all_labels() -> BTreeMap<String, String> {
        let mut labels = Self::app_labels();
        labels.insert(LABEL_GARDEN_ROLE.into(), NAME.into());
        labels
    }

    fn deployment(&self) -> Deployment {
        Deployment {
            metadata: object_meta(NAME, &self.namespace, Self::all_labels()),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                revision_history_limit: Some(2),
                selector: label_selector(Self::app_labels()),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(Self::all_labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "grafana".into(),
                            image: Some(self.values.image.clone()),
                            image_pull_policy: Some("IfNotPresent".into()),
                            ports: Some(vec![ContainerPort {
                                name: Some("web".into()),
                                container_port: PORT,
                                protocol: Some("TCP".into()),
                                ..Default::default()
                            }]),
                            resources: Some(ResourceRequirements {
                                requests: Some(BTreeMap::from([
                                    ("cpu".into(), Quantity("10m".into())),
                                    ("memory".into(), Quantity("50Mi".into())),
                                ])),
                                limits: Some(BTreeMap::from([(
                                    "memory".into(),
                                    Quantity("400Mi".into()),
                                )])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl DeployWaiter for OperatorGrafana {
    async fn deploy(&self) -> Result<()> {
        deploy_resource_configs(
            &self.client,
            &self.namespace,
            ClusterType::Shoot,
            MANAGED_RESOURCE_NAME,
            BTreeMap::new(),
            &self.resource_configs()?,
        )
        .await
    }

    async fn destroy(&self) -> Result<()> {
        destroy_resource_configs(
            &self.client,
            &self.namespace,
            ClusterType::Shoot,
            MANAGED_RESOURCE_NAME,
            &self.resource_configs()?,
        )
        .await
    }

    async fn wait(&self) -> Result<()> {
        managedresources::wait_until_healthy(&self.client, &self.namespace, MANAGED_RESOURCE_NAME)
            .await
    }

    async fn wait_cleanup(&self) -> Result<()> {
        managedresources::wait_until_deleted(&self.client, &self.namespace, MANAGED_RESOURCE_NAME)
            .await
    }
}
