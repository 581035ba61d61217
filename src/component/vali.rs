//! Vali log storage for a shoot control plane, plus the removal helpers for Vali, the Loki stack
//! it replaces and the seed-level logging stack.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Secret, Service, ServiceAccount,
    ServicePort, ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ApiResource, GroupVersionKind};
use kube::{Api, Client};
use tracing::*;

use super::{
    apply_resource_configs, delete_all_of, delete_objects, label_selector, object_meta,
    DeployWaiter, ObjectKey, ResourceConfig, GARDEN_NAMESPACE, LABEL_APP, LABEL_GARDEN_ROLE,
    LABEL_ROLE,
};
use crate::utils::polling::{Attempt, PollingConfig};
use crate::{health, Result};

pub const NAME: &str = "vali";
pub const PVC_NAME: &str = "vali-vali-0";
pub const LOKI_PVC_NAME: &str = "loki-loki-0";
pub const ROLE_LOGGING: &str = "logging";

const PORT: i32 = 3100;
const CONFIG_MAP_NAME: &str = "vali-config";
const VOLUME_NAME_CONFIG: &str = "config";

const DEFAULT_CONFIG: &str = r#"auth_enabled: false
ingester:
  chunk_target_size: 1536000
  chunk_idle_period: 3m
  chunk_block_size: 262144
  chunk_retain_period: 3m
  max_transfer_retries: 3
  lifecycler:
    ring:
      kvstore:
        store: inmemory
      replication_factor: 1
limits_config:
  enforce_metric_name: false
  reject_old_samples: true
  reject_old_samples_max_age: 168h
schema_config:
  configs:
  - from: 2018-04-15
    store: boltdb
    object_store: filesystem
    schema: v11
    index:
      prefix: index_
      period: 24h
server:
  http_listen_port: 3100
storage_config:
  boltdb:
    directory: /data/vali/index
  filesystem:
    directory: /data/vali/chunks
chunk_store_config:
  max_look_back_period: 360h
table_manager:
  retention_deletes_enabled: true
  retention_period: 360h
"#;

#[derive(Clone, Debug)]
pub struct Values {
    pub image: String,
    pub replicas: i32,
    pub priority_class_name: String,
    pub storage: Quantity,
}

pub struct Vali {
    client: Client,
    namespace: String,
    values: Values,
}

/// Labels shared by every Vali object; removal of labelled ConfigMaps relies on them
pub fn labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_GARDEN_ROLE.into(), ROLE_LOGGING.into()),
        (LABEL_APP.into(), app.into()),
    ])
}

impl Vali {
    pub fn new(client: Client, namespace: impl Into<String>, values: Values) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            values,
        }
    }

    fn pod_labels() -> BTreeMap<String, String> {
        let mut labels = labels(NAME);
        labels.insert(LABEL_ROLE.into(), ROLE_LOGGING.into());
        labels
    }

    pub fn resource_configs(&self) -> Result<Vec<ResourceConfig>> {
        Ok(vec![
            ResourceConfig::runtime(&self.config_map())?,
            ResourceConfig::runtime(&self.service())?,
            ResourceConfig::runtime(&self.stateful_set())?,
        ])
    }

    fn config_map(&self) -> ConfigMap {
        ConfigMap {
            metadata: object_meta(CONFIG_MAP_NAME, &self.namespace, labels(NAME)),
            data: Some(BTreeMap::from([("vali.yaml".into(), DEFAULT_CONFIG.into())])),
            ..Default::default()
        }
    }

    fn service(&self) -> Service {
        Service {
            metadata: object_meta(NAME, &self.namespace, labels(NAME)),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".into()),
                selector: Some(labels(NAME)),
                ports: Some(vec![ServicePort {
                    name: Some("metrics".into()),
                    port: PORT,
                    target_port: Some(IntOrString::String("metrics".into())),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn stateful_set(&self) -> StatefulSet {
        StatefulSet {
            metadata: object_meta(NAME, &self.namespace, labels(NAME)),
            spec: Some(StatefulSetSpec {
                replicas: Some(self.values.replicas),
                service_name: NAME.into(),
                selector: label_selector(labels(NAME)),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(Self::pod_labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        priority_class_name: Some(self.values.priority_class_name.clone()),
                        automount_service_account_token: Some(false),
                        containers: vec![Container {
                            name: NAME.into(),
                            image: Some(self.values.image.clone()),
                            args: Some(vec!["-config.file=/etc/vali/vali.yaml".into()]),
                            ports: Some(vec![ContainerPort {
                                name: Some("metrics".into()),
                                container_port: PORT,
                                protocol: Some("TCP".into()),
                                ..Default::default()
                            }]),
                            volume_mounts: Some(vec![
                                VolumeMount {
                                    name: VOLUME_NAME_CONFIG.into(),
                                    mount_path: "/etc/vali".into(),
                                    ..Default::default()
                                },
                                VolumeMount {
                                    name: NAME.into(),
                                    mount_path: "/data".into(),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: VOLUME_NAME_CONFIG.into(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: CONFIG_MAP_NAME.into(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(NAME.into()),
                        labels: Some(labels(NAME)),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".into()]),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([(
                                "storage".into(),
                                self.values.storage.clone(),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl DeployWaiter for Vali {
    async fn deploy(&self) -> Result<()> {
        info!("Deploying vali in namespace {}", self.namespace);
        apply_resource_configs(&self.client, &self.namespace, &self.resource_configs()?).await
    }

    async fn destroy(&self) -> Result<()> {
        delete_vali(&self.client, &self.namespace).await
    }

    async fn wait(&self) -> Result<()> {
        let api = &Api::<StatefulSet>::namespaced(self.client.clone(), &self.namespace);
        PollingConfig::new(
            super::managedresources::TIMEOUT_WAIT_FOR_MANAGED_RESOURCE,
            super::managedresources::INTERVAL_WAIT_FOR_MANAGED_RESOURCE,
            format!("StatefulSet {}/{NAME}", self.namespace),
        )
        .poll(|| async move {
            match api.get_opt(NAME).await? {
                None => Ok(Attempt::Retry("not found".into())),
                Some(sts) => match health::check_stateful_set(&sts) {
                    Ok(()) => Ok(Attempt::Ready(())),
                    Err(err) => Ok(Attempt::Retry(err.to_string())),
                },
            }
        })
        .await
    }

    async fn wait_cleanup(&self) -> Result<()> {
        let api = &Api::<StatefulSet>::namespaced(self.client.clone(), &self.namespace);
        PollingConfig::new(
            super::managedresources::TIMEOUT_WAIT_FOR_MANAGED_RESOURCE,
            super::managedresources::INTERVAL_WAIT_FOR_MANAGED_RESOURCE,
            format!("deletion of StatefulSet {}/{NAME}", self.namespace),
        )
        .poll(|| async move {
            match api.get_opt(NAME).await? {
                None => Ok(Attempt::Ready(())),
                Some(_) => Ok(Attempt::Retry("still exists".into())),
            }
        })
        .await
    }
}

fn hvpa_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "autoscaling.k8s.io",
        "v1alpha1",
        "Hvpa",
    ))
}

/// Delete every Vali object in `namespace`, including its PVC and labelled ConfigMaps
pub async fn delete_vali(client: &Client, namespace: &str) -> Result<()> {
    delete_objects(
        client,
        &[
            ObjectKey::namespaced::<NetworkPolicy>(namespace, "allow-vali"),
            ObjectKey::namespaced::<NetworkPolicy>(namespace, "allow-to-vali"),
            ObjectKey::dynamic(hvpa_resource(), namespace, NAME),
            ObjectKey::namespaced::<Service>(namespace, NAME),
            ObjectKey::namespaced::<Service>(namespace, "logging"),
            ObjectKey::namespaced::<StatefulSet>(namespace, NAME),
            ObjectKey::namespaced::<Ingress>(namespace, NAME),
            ObjectKey::namespaced::<Secret>(namespace, "shoot-access-valitail"),
            ObjectKey::namespaced::<PersistentVolumeClaim>(namespace, PVC_NAME),
        ],
    )
    .await?;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    delete_all_of(&config_maps, &labels(NAME)).await
}

/// Delete the Loki stack in `namespace` but keep its PVC so it can be taken over by Vali
pub async fn delete_loki_retain_pvc(client: &Client, namespace: &str) -> Result<()> {
    delete_objects(
        client,
        &[
            ObjectKey::namespaced::<NetworkPolicy>(namespace, "allow-loki"),
            ObjectKey::namespaced::<NetworkPolicy>(namespace, "allow-to-loki"),
            ObjectKey::dynamic(hvpa_resource(), namespace, "loki"),
            ObjectKey::namespaced::<Service>(namespace, "loki"),
            ObjectKey::namespaced::<StatefulSet>(namespace, "loki"),
            ObjectKey::namespaced::<Ingress>(namespace, "loki"),
            ObjectKey::namespaced::<Secret>(namespace, "shoot-access-promtail"),
        ],
    )
    .await?;

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    delete_all_of(&config_maps, &labels("loki")).await
}

/// Delete the seed's fluent-bit stack and Vali from the garden namespace
pub async fn delete_seed_logging_stack(client: &Client) -> Result<()> {
    delete_objects(
        client,
        &[
            ObjectKey::namespaced::<ConfigMap>(GARDEN_NAMESPACE, "fluent-bit-config"),
            ObjectKey::namespaced::<DaemonSet>(GARDEN_NAMESPACE, "fluent-bit"),
            ObjectKey::namespaced::<NetworkPolicy>(GARDEN_NAMESPACE, "allow-fluentbit"),
            ObjectKey::cluster::<ClusterRole>("fluent-bit-read"),
            ObjectKey::cluster::<ClusterRoleBinding>("fluent-bit-read"),
            ObjectKey::namespaced::<ServiceAccount>(GARDEN_NAMESPACE, "fluent-bit"),
            ObjectKey::namespaced::<Service>(GARDEN_NAMESPACE, "fluent-bit"),
        ],
    )
    .await?;

    delete_vali(client, GARDEN_NAMESPACE).await
}

/// Remove the node logging pieces that live next to Vali
pub async fn delete_shoot_node_logging(client: &Client, namespace: &str) -> Result<()> {
    delete_objects(
        client,
        &[
            ObjectKey::namespaced::<Ingress>(namespace, NAME),
            ObjectKey::namespaced::<NetworkPolicy>(
                namespace,
                "allow-from-prometheus-to-vali-telegraf",
            ),
            ObjectKey::namespaced::<ConfigMap>(namespace, "telegraf-config"),
        ],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{mock_client, success_status};
    use http::Method;

    fn values() -> Values {
        Values {
            image: "vali:v2.2.5".into(),
            replicas: 1,
            priority_class_name: "gardener-system-100".into(),
            storage: Quantity("30Gi".into()),
        }
    }

    #[tokio::test]
    async fn stateful_set_claims_vali_volume() {
        let (client, _) = mock_client();
        let vali = Vali::new(client, "shoot--foo--bar", values());

        let sts = vali.stateful_set();
        let spec = sts.spec.unwrap();
        let claim = &spec.volume_claim_templates.unwrap()[0];
        assert_eq!(claim.metadata.name.as_deref(), Some("vali"));
        assert_eq!(
            claim.spec.as_ref().unwrap().resources.as_ref().unwrap().requests.as_ref().unwrap()
                ["storage"],
            Quantity("30Gi".into())
        );
        let pod_labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(pod_labels["role"], "logging");
        assert_eq!(
            spec.selector.match_labels.unwrap(),
            labels("vali")
        );
    }

    #[tokio::test]
    async fn deploy_applies_objects_directly() {
        let (client, mut server) = mock_client();
        let vali = Vali::new(client, "shoot--foo--bar", values());

        let server = tokio::spawn(async move {
            let cm = server
                .echo(Method::PATCH, "/api/v1/namespaces/shoot--foo--bar/configmaps/vali-config")
                .await;
            assert_eq!(cm["metadata"]["labels"]["gardener.cloud/role"], "logging");
            server
                .echo(Method::PATCH, "/api/v1/namespaces/shoot--foo--bar/services/vali")
                .await;
            let sts = server
                .echo(
                    Method::PATCH,
                    "/apis/apps/v1/namespaces/shoot--foo--bar/statefulsets/vali",
                )
                .await;
            assert_eq!(sts["spec"]["replicas"], 1);
        });

        vali.deploy().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn delete_vali_removes_objects_and_labelled_config_maps() {
        let (client, mut server) = mock_client();
        let ns = "shoot--foo--bar";

        let server = tokio::spawn(async move {
            let paths = [
                format!("/apis/networking.k8s.io/v1/namespaces/{ns}/networkpolicies/allow-vali"),
                format!("/apis/networking.k8s.io/v1/namespaces/{ns}/networkpolicies/allow-to-vali"),
                format!("/apis/autoscaling.k8s.io/v1alpha1/namespaces/{ns}/hvpas/vali"),
                format!("/api/v1/namespaces/{ns}/services/vali"),
                format!("/api/v1/namespaces/{ns}/services/logging"),
                format!("/apis/apps/v1/namespaces/{ns}/statefulsets/vali"),
                format!("/apis/networking.k8s.io/v1/namespaces/{ns}/ingresses/vali"),
                format!("/api/v1/namespaces/{ns}/secrets/shoot-access-valitail"),
                format!("/api/v1/namespaces/{ns}/persistentvolumeclaims/vali-vali-0"),
            ];
            for (i, path) in paths.iter().enumerate() {
                if i % 3 == 0 {
                    server.not_found(Method::DELETE, path).await;
                } else {
                    server.ok(Method::DELETE, path, success_status()).await;
                }
            }
            server
                .ok(
                    Method::DELETE,
                    &format!("/api/v1/namespaces/{ns}/configmaps"),
                    success_status(),
                )
                .await;
        });

        delete_vali(&client, ns).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn delete_loki_keeps_pvc() {
        let (client, mut server) = mock_client();

        let server = tokio::spawn(async move {
            for _ in 0..7 {
                let (request, send) = server.next_raw().await;
                assert_eq!(request.method(), Method::DELETE);
                assert!(!request.uri().path().contains("persistentvolumeclaims"));
                send.send_response(crate::fixtures::status_response(404));
            }
            let (request, send) = server.next_raw().await;
            assert_eq!(request.uri().path(), "/api/v1/namespaces/shoot--foo--bar/configmaps");
            assert!(request
                .uri()
                .query()
                .unwrap()
                .contains("labelSelector=app%3Dloki%2Cgardener.cloud%2Frole%3Dlogging"));
            send.send_response(crate::fixtures::status_response(200));
        });

        delete_loki_retain_pvc(&client, "shoot--foo--bar").await.unwrap();
        server.await.unwrap();
    }
}
