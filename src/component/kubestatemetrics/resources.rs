use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::autoscaling::v1::CrossVersionObjectReference;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, KeyToPath,
    PodSpec, PodTemplateSpec, Probe, ProjectedVolumeSource, ResourceRequirements, Secret,
    SecretProjection, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeProjection,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Value};
use sha2::Digest;

use super::KubeStateMetrics;
use crate::component::{
    label_selector, object_meta, ClusterType, ResourceConfig, ANNOTATION_DELETE_ON_INVALID_UPDATE,
    KUBE_SYSTEM_NAMESPACE, LABEL_GARDEN_ROLE, LABEL_NETWORK_POLICY_ALLOWED,
    LABEL_NETWORK_POLICY_TO_DNS, LABEL_NETWORK_POLICY_TO_RUNTIME_APISERVER, LABEL_ROLE,
};
use crate::resources::autoscaling::{
    ContainerResourcePolicy, PodResourcePolicy, PodUpdatePolicy, VerticalPodAutoscaler,
    VerticalPodAutoscalerSpec, CONTROLLED_VALUES_REQUESTS_ONLY, UPDATE_MODE_AUTO,
};
use crate::resources::monitoring::{
    KubernetesSdConfig, NamespaceDiscovery, PrometheusRule, PrometheusRuleSpec, RelabelConfig,
    Rule, RuleGroup, ScrapeConfig, ScrapeConfigSpec,
};
use crate::Result;

const NAME: &str = "kube-state-metrics";
const CONTAINER_NAME: &str = "kube-state-metrics";

const LABEL_KEY_COMPONENT: &str = "component";
const LABEL_KEY_TYPE: &str = "type";
const LABEL_VALUE_COMPONENT: &str = "kube-state-metrics";

const PORT: i32 = 8080;
const PORT_NAME_METRICS: &str = "metrics";

const CUSTOM_RESOURCE_STATE_CONFIG_MAP_NAME: &str = "custom-resource-state-config";
const CUSTOM_RESOURCE_STATE_CONFIG_MOUNT_DIR: &str = "/config";
const CUSTOM_RESOURCE_STATE_CONFIG_MOUNT_FILE: &str = "custom-resource-state.yaml";

pub(super) const GENERIC_TOKEN_KUBECONFIG: &str = "generic-token-kubeconfig";
pub(super) const SHOOT_ACCESS_SECRET_NAME: &str = "shoot-access-kube-state-metrics";
const VOLUME_NAME_KUBECONFIG: &str = "kubeconfig";
const PATH_GENERIC_KUBECONFIG_DIR: &str = "/var/run/secrets/gardener.cloud/shoot/generic-kubeconfig";

const PROMETHEUS_CACHE: &str = "cache";
const PROMETHEUS_SEED: &str = "seed";
const PROMETHEUS_GARDEN: &str = "garden";
const PROMETHEUS_SHOOT: &str = "shoot";

const SHOOT_ALLOWED_METRICS: &[&str] = &[
    "^kube_daemonset_metadata_generation$",
    "^kube_daemonset_status_current_number_scheduled$",
    "^kube_daemonset_status_desired_number_scheduled$",
    "^kube_daemonset_status_number_available$",
    "^kube_daemonset_status_number_unavailable$",
    "^kube_daemonset_status_updated_number_scheduled$",
    "^kube_deployment_metadata_generation$",
    "^kube_deployment_spec_replicas$",
    "^kube_deployment_status_observed_generation$",
    "^kube_deployment_status_replicas$",
    "^kube_deployment_status_replicas_available$",
    "^kube_deployment_status_replicas_unavailable$",
    "^kube_deployment_status_replicas_updated$",
    "^kube_node_info$",
    "^kube_node_labels$",
    "^kube_node_spec_taint$",
    "^kube_node_spec_unschedulable$",
    "^kube_node_status_allocatable$",
    "^kube_node_status_capacity$",
    "^kube_node_status_condition$",
    "^kube_pod_container_info$",
    "^kube_pod_container_resource_limits$",
    "^kube_pod_container_resource_requests$",
    "^kube_pod_container_status_restarts_total$",
    "^kube_pod_info$",
    "^kube_pod_labels$",
    "^kube_pod_status_phase$",
    "^kube_pod_status_ready$",
    "^kube_replicaset_owner$",
    "^kube_replicaset_metadata_generation$",
    "^kube_replicaset_spec_replicas$",
    "^kube_replicaset_status_observed_generation$",
    "^kube_replicaset_status_replicas$",
    "^kube_replicaset_status_ready_replicas$",
    "^kube_statefulset_metadata_generation$",
    "^kube_statefulset_replicas$",
    "^kube_statefulset_status_observed_generation$",
    "^kube_statefulset_status_replicas$",
    "^kube_statefulset_status_replicas_current$",
    "^kube_statefulset_status_replicas_ready$",
    "^kube_statefulset_status_replicas_updated$",
];

const CACHE_ALLOWED_METRICS: &[&str] = &[
    "^kube_daemonset_metadata_generation$",
    "^kube_daemonset_status_current_number_scheduled$",
    "^kube_daemonset_status_desired_number_scheduled$",
    "^kube_daemonset_status_number_available$",
    "^kube_daemonset_status_number_unavailable$",
    "^kube_daemonset_status_updated_number_scheduled$",
    "^kube_deployment_metadata_generation$",
    "^kube_deployment_spec_replicas$",
    "^kube_deployment_status_observed_generation$",
    "^kube_deployment_status_replicas$",
    "^kube_deployment_status_replicas_available$",
    "^kube_deployment_status_replicas_unavailable$",
    "^kube_deployment_status_replicas_updated$",
    "^kube_horizontalpodautoscaler_spec_max_replicas$",
    "^kube_horizontalpodautoscaler_spec_min_replicas$",
    "^kube_horizontalpodautoscaler_status_current_replicas$",
    "^kube_horizontalpodautoscaler_status_desired_replicas$",
    "^kube_horizontalpodautoscaler_status_condition$",
    "^kube_namespace_annotations$",
    "^kube_node_info$",
    "^kube_node_labels$",
    "^kube_node_spec_taint$",
    "^kube_node_spec_unschedulable$",
    "^kube_node_status_allocatable$",
    "^kube_node_status_capacity$",
    "^kube_node_status_condition$",
    "^kube_persistentvolumeclaim_resource_requests_storage_bytes$",
    "^kube_pod_container_info$",
    "^kube_pod_container_resource_limits$",
    "^kube_pod_container_resource_requests$",
    "^kube_pod_container_status_restarts_total$",
    "^kube_pod_info$",
    "^kube_pod_labels$",
    "^kube_pod_owner$",
    "^kube_pod_spec_volumes_persistentvolumeclaims_info$",
    "^kube_pod_status_phase$",
    "^kube_pod_status_ready$",
    "^kube_replicaset_owner$",
    "^kube_statefulset_metadata_generation$",
    "^kube_statefulset_replicas$",
    "^kube_statefulset_status_observed_generation$",
    "^kube_statefulset_status_replicas$",
    "^kube_statefulset_status_replicas_current$",
    "^kube_statefulset_status_replicas_ready$",
    "^kube_statefulset_status_replicas_updated$",
];

/// VPA fields exported through the custom resource state config, `(metric, path, value)`
const VPA_METRICS: &[(&str, &[&str], &str)] = &[
    (
        "status_recommendation_containerrecommendations_target",
        &["status", "recommendation", "containerRecommendations"],
        "target",
    ),
    (
        "status_recommendation_containerrecommendations_uncappedtarget",
        &["status", "recommendation", "containerRecommendations"],
        "uncappedTarget",
    ),
    (
        "status_recommendation_containerrecommendations_upperbound",
        &["status", "recommendation", "containerRecommendations"],
        "upperBound",
    ),
    (
        "status_recommendation_containerrecommendations_lowerbound",
        &["status", "recommendation", "containerRecommendations"],
        "lowerBound",
    ),
    (
        "spec_resourcepolicy_containerpolicies_minallowed",
        &["spec", "resourcePolicy", "containerPolicies"],
        "minAllowed",
    ),
    (
        "spec_resourcepolicy_containerpolicies_maxallowed",
        &["spec", "resourcePolicy", "containerPolicies"],
        "maxAllowed",
    ),
];

/// Every metric exported from the custom resource state config, as an allow-list entry
fn vpa_allowed_metrics() -> impl Iterator<Item = String> {
    VPA_METRICS
        .iter()
        .flat_map(|(metric, _, _)| {
            ["cpu", "memory"].map(|resource| {
                format!("^kube_customresource_verticalpodautoscaler_{metric}_{resource}$")
            })
        })
        .chain(std::iter::once(
            "^kube_customresource_verticalpodautoscaler_spec_updatepolicy_updatemode$".into(),
        ))
}

fn allow_list(metrics: &[&str]) -> String {
    metrics
        .iter()
        .map(|m| m.to_string())
        .chain(vpa_allowed_metrics())
        .collect::<Vec<_>>()
        .join(",")
}

/// kube-state-metrics CustomResourceStateMetrics for VerticalPodAutoscalers
pub(super) fn custom_resource_state_config() -> Value {
    let mut metrics: Vec<Value> = VPA_METRICS
        .iter()
        .flat_map(|(metric, path, value)| {
            [("cpu", "core"), ("memory", "byte")].map(|(resource, unit)| {
                json!({
                    "name": format!("{metric}_{resource}"),
                    "help": format!("Vertical Pod Autoscaler container {value} for {resource}."),
                    "commonLabels": {"resource": resource, "unit": unit},
                    "each": {
                        "type": "Gauge",
                        "gauge": {
                            "path": path,
                            "valueFrom": [value, resource],
                            "labelsFromPath": {"container": ["containerName"]},
                        }
                    }
                })
            })
        })
        .collect();
    metrics.push(json!({
        "name": "spec_updatepolicy_updatemode",
        "help": "Update mode of the Vertical Pod Autoscaler.",
        "each": {
            "type": "StateSet",
            "stateSet": {
                "labelName": "update_mode",
                "path": ["spec", "updatePolicy", "updateMode"],
                "list": ["Off", "Initial", "Recreate", "Auto"],
            }
        }
    }));

    json!({
        "kind": "CustomResourceStateMetrics",
        "spec": {
            "resources": [{
                "groupVersionKind": {
                    "group": "autoscaling.k8s.io",
                    "kind": "VerticalPodAutoscaler",
                    "version": "v1",
                },
                "labelsFromPath": {
                    "namespace": ["metadata", "namespace"],
                    "verticalpodautoscaler": ["metadata", "name"],
                    "target_api_version": ["spec", "targetRef", "apiVersion"],
                    "target_kind": ["spec", "targetRef", "kind"],
                    "target_name": ["spec", "targetRef", "name"],
                },
                "metricNamePrefix": "kube_customresource_verticalpodautoscaler",
                "metrics": metrics,
            }]
        }
    })
}

/// Metadata for monitoring configuration picked up by the Prometheus named `prometheus`
fn config_object_meta(name: &str, namespace: &str, prometheus: &str) -> ObjectMeta {
    object_meta(
        &format!("{prometheus}-{name}"),
        namespace,
        BTreeMap::from([("prometheus".into(), prometheus.into())]),
    )
}

/// Keep only the listed metrics
fn standard_metric_relabel_config(metrics: &[&str]) -> RelabelConfig {
    RelabelConfig::keep(&["__name__"], format!("^({})$", metrics.join("|")))
}

fn scrape_target_ports_annotation() -> String {
    json!([{"protocol": "TCP", "port": PORT}]).to_string()
}

impl KubeStateMetrics {
    pub(super) fn resource_configs(
        &self,
        generic_token_kubeconfig_secret_name: Option<&str>,
        custom_resource_state_config: &str,
    ) -> Result<Vec<ResourceConfig>> {
        let config_map = self.custom_resource_state_config_map(custom_resource_state_config);
        let config_map_name = config_map.metadata.name.clone().unwrap_or_default();

        let mut configs = vec![
            ResourceConfig::application(&self.cluster_role())?,
            ResourceConfig::runtime(&self.service())?,
            ResourceConfig::runtime(&self.vertical_pod_autoscaler())?,
            ResourceConfig::runtime(&config_map)?,
        ];

        match self.values.cluster_type {
            ClusterType::Seed => {
                let service_account = self.service_account();
                configs.extend([
                    ResourceConfig::runtime(&service_account)?,
                    ResourceConfig::application(
                        &self.cluster_role_binding(NAME, &self.namespace),
                    )?,
                    ResourceConfig::runtime(&self.deployment(&config_map_name, None))?,
                    ResourceConfig::runtime(&self.pod_disruption_budget())?,
                    ResourceConfig::runtime(&self.scrape_config_cache())?,
                    ResourceConfig::runtime(&self.scrape_config_seed())?,
                    ResourceConfig::runtime(&self.scrape_config_garden())?,
                ]);
            }
            ClusterType::Shoot => {
                configs.extend([
                    ResourceConfig::application(
                        &self.cluster_role_binding(NAME, KUBE_SYSTEM_NAMESPACE),
                    )?,
                    ResourceConfig::runtime(&self.deployment(
                        &config_map_name,
                        Some(generic_token_kubeconfig_secret_name.unwrap_or(GENERIC_TOKEN_KUBECONFIG)),
                    ))?,
                    ResourceConfig::runtime(&self.prometheus_rule_shoot())?,
                ]);
                if !self.values.is_workerless {
                    configs.push(ResourceConfig::runtime(&self.scrape_config_shoot())?);
                }
            }
        }

        Ok(configs)
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_KEY_COMPONENT.into(), LABEL_VALUE_COMPONENT.into()),
            (
                LABEL_KEY_TYPE.into(),
                self.values.cluster_type.as_str().into(),
            ),
        ])
    }

    fn name_suffix(&self) -> &'static str {
        match self.values.cluster_type {
            ClusterType::Seed => "kube-state-metrics-seed",
            ClusterType::Shoot => "kube-state-metrics",
        }
    }

    fn service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: object_meta(NAME, &self.namespace, self.labels()),
            automount_service_account_token: Some(false),
            ..Default::default()
        }
    }

    pub(super) fn shoot_access_secret(&self) -> Secret {
        let mut metadata = object_meta(
            SHOOT_ACCESS_SECRET_NAME,
            &self.namespace,
            BTreeMap::from([
                (
                    "resources.gardener.cloud/purpose".into(),
                    "token-requestor".into(),
                ),
                ("resources.gardener.cloud/class".into(), "shoot".into()),
            ]),
        );
        metadata.annotations = Some(BTreeMap::from([
            (
                "serviceaccount.resources.gardener.cloud/name".into(),
                NAME.into(),
            ),
            (
                "serviceaccount.resources.gardener.cloud/namespace".into(),
                KUBE_SYSTEM_NAMESPACE.into(),
            ),
        ]));
        Secret {
            metadata,
            type_: Some("Opaque".into()),
            ..Default::default()
        }
    }

    pub(super) fn cluster_role(&self) -> ClusterRole {
        let rule = |groups: &[&str], resources: &[&str]| PolicyRule {
            api_groups: Some(groups.iter().map(|g| g.to_string()).collect()),
            resources: Some(resources.iter().map(|r| r.to_string()).collect()),
            verbs: vec!["list".into(), "watch".into()],
            ..Default::default()
        };

        let mut rules = vec![
            rule(
                &[""],
                &[
                    "nodes",
                    "pods",
                    "services",
                    "resourcequotas",
                    "replicationcontrollers",
                    "limitranges",
                    "persistentvolumeclaims",
                    "namespaces",
                ],
            ),
            rule(
                &["apps", "extensions"],
                &["daemonsets", "deployments", "replicasets", "statefulsets"],
            ),
            rule(&["batch"], &["cronjobs", "jobs"]),
            rule(&["apiextensions.k8s.io"], &["customresourcedefinitions"]),
            rule(&["autoscaling.k8s.io"], &["verticalpodautoscalers"]),
        ];
        if self.values.cluster_type == ClusterType::Seed {
            rules.push(rule(&["autoscaling"], &["horizontalpodautoscalers"]));
        }

        ClusterRole {
            metadata: object_meta(
                &format!("gardener.cloud:monitoring:{}", self.name_suffix()),
                "",
                self.labels(),
            ),
            rules: Some(rules),
            ..Default::default()
        }
    }

    fn cluster_role_binding(
        &self,
        service_account_name: &str,
        service_account_namespace: &str,
    ) -> ClusterRoleBinding {
        let name = format!("gardener.cloud:monitoring:{}", self.name_suffix());
        let mut metadata = object_meta(&name, "", self.labels());
        metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_DELETE_ON_INVALID_UPDATE.into(),
            "true".into(),
        )]));

        ClusterRoleBinding {
            metadata,
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name,
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: service_account_name.into(),
                namespace: Some(service_account_namespace.into()),
                ..Default::default()
            }]),
        }
    }

    fn service(&self) -> Service {
        let mut metadata = object_meta(NAME, &self.namespace, self.labels());
        let ports = scrape_target_ports_annotation();
        metadata.annotations = Some(match self.values.cluster_type {
            ClusterType::Seed => BTreeMap::from([
                (
                    "networking.resources.gardener.cloud/from-all-garden-scrape-targets-allowed-ports"
                        .into(),
                    ports.clone(),
                ),
                (
                    "networking.resources.gardener.cloud/from-all-seed-scrape-targets-allowed-ports"
                        .into(),
                    ports,
                ),
            ]),
            ClusterType::Shoot => BTreeMap::from([(
                "networking.resources.gardener.cloud/from-all-scrape-targets-allowed-ports".into(),
                ports,
            )]),
        });

        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".into()),
                selector: Some(self.labels()),
                ports: Some(vec![ServicePort {
                    name: Some(PORT_NAME_METRICS.into()),
                    port: 80,
                    target_port: Some(IntOrString::Int(PORT)),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(super) fn deployment(
        &self,
        config_map_name: &str,
        generic_token_kubeconfig_secret_name: Option<&str>,
    ) -> Deployment {
        let mut deployment_labels = self.labels();
        let mut pod_labels = BTreeMap::from([(
            LABEL_NETWORK_POLICY_TO_DNS.to_string(),
            LABEL_NETWORK_POLICY_ALLOWED.to_string(),
        )]);
        let mut args = vec![format!("--port={PORT}"), "--telemetry-port=8081".to_string()];
        let custom_resource_state_config_file = format!(
            "{CUSTOM_RESOURCE_STATE_CONFIG_MOUNT_DIR}/{CUSTOM_RESOURCE_STATE_CONFIG_MOUNT_FILE}"
        );

        match self.values.cluster_type {
            ClusterType::Seed => {
                deployment_labels.insert(LABEL_ROLE.into(), "monitoring".into());
                pod_labels.extend(deployment_labels.clone());
                pod_labels.insert(
                    LABEL_NETWORK_POLICY_TO_RUNTIME_APISERVER.into(),
                    LABEL_NETWORK_POLICY_ALLOWED.into(),
                );
                args.extend([
                    "--resources=deployments,pods,statefulsets,nodes,horizontalpodautoscalers,persistentvolumeclaims,replicasets,namespaces".to_string(),
                    "--metric-labels-allowlist=nodes=[*],pods=[origin]".to_string(),
                    "--metric-annotations-allowlist=namespaces=[shoot.gardener.cloud/uid]".to_string(),
                    format!("--metric-allowlist={}", allow_list(CACHE_ALLOWED_METRICS)),
                    format!("--custom-resource-state-config-file={custom_resource_state_config_file}"),
                ]);
            }
            ClusterType::Shoot => {
                deployment_labels.insert(LABEL_GARDEN_ROLE.into(), "monitoring".into());
                pod_labels.extend(deployment_labels.clone());
                pod_labels.insert(
                    "networking.resources.gardener.cloud/to-kube-apiserver-tcp-443".into(),
                    LABEL_NETWORK_POLICY_ALLOWED.into(),
                );
                args.extend([
                    "--resources=daemonsets,deployments,nodes,pods,statefulsets,replicasets"
                        .to_string(),
                    format!("--namespaces={KUBE_SYSTEM_NAMESPACE}"),
                    format!("--kubeconfig={PATH_GENERIC_KUBECONFIG_DIR}/kubeconfig"),
                    "--metric-labels-allowlist=nodes=[*],pods=[origin]".to_string(),
                    format!("--metric-allowlist={}", allow_list(SHOOT_ALLOWED_METRICS)),
                    format!("--custom-resource-state-config-file={custom_resource_state_config_file}"),
                ]);
            }
        }

        let health_probe = |period_seconds, success_threshold, failure_threshold| Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".into()),
                port: IntOrString::Int(PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            timeout_seconds: Some(5),
            period_seconds,
            success_threshold,
            failure_threshold,
            ..Default::default()
        };

        let mut volume_mounts = vec![VolumeMount {
            name: CUSTOM_RESOURCE_STATE_CONFIG_MAP_NAME.into(),
            mount_path: CUSTOM_RESOURCE_STATE_CONFIG_MOUNT_DIR.into(),
            read_only: Some(true),
            ..Default::default()
        }];
        let mut volumes = vec![Volume {
            name: CUSTOM_RESOURCE_STATE_CONFIG_MAP_NAME.into(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name.into(),
                ..Default::default()
            }),
            ..Default::default()
        }];

        let mut pod_spec = PodSpec {
            priority_class_name: Some(self.values.priority_class_name.clone()),
            ..Default::default()
        };

        match (self.values.cluster_type, generic_token_kubeconfig_secret_name) {
            (ClusterType::Shoot, Some(kubeconfig_secret)) => {
                pod_spec.automount_service_account_token = Some(false);
                volume_mounts.push(VolumeMount {
                    name: VOLUME_NAME_KUBECONFIG.into(),
                    mount_path: PATH_GENERIC_KUBECONFIG_DIR.into(),
                    read_only: Some(true),
                    ..Default::default()
                });
                volumes.push(generic_kubeconfig_volume(kubeconfig_secret, SHOOT_ACCESS_SECRET_NAME));
            }
            _ => pod_spec.service_account_name = Some(NAME.into()),
        }

        pod_spec.containers = vec![Container {
            name: CONTAINER_NAME.into(),
            image: Some(self.values.image.clone()),
            image_pull_policy: Some("IfNotPresent".into()),
            args: Some(args),
            ports: Some(vec![ContainerPort {
                name: Some(PORT_NAME_METRICS.into()),
                container_port: PORT,
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            liveness_probe: Some(health_probe(None, None, None)),
            readiness_probe: Some(health_probe(Some(30), Some(1), Some(3))),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".into(), Quantity("10m".into())),
                    ("memory".into(), Quantity("32Mi".into())),
                ])),
                ..Default::default()
            }),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }];
        pod_spec.volumes = Some(volumes);

        Deployment {
            metadata: object_meta(NAME, &self.namespace, deployment_labels),
            spec: Some(DeploymentSpec {
                replicas: Some(self.values.replicas),
                revision_history_limit: Some(2),
                selector: label_selector(self.labels()),
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".into()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_unavailable: Some(IntOrString::Int(1)),
                        ..Default::default()
                    }),
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn vertical_pod_autoscaler(&self) -> VerticalPodAutoscaler {
        let mut vpa = VerticalPodAutoscaler::new(
            "kube-state-metrics-vpa",
            VerticalPodAutoscalerSpec {
                target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".into()),
                    kind: "Deployment".into(),
                    name: NAME.into(),
                },
                update_policy: Some(PodUpdatePolicy {
                    update_mode: Some(UPDATE_MODE_AUTO.into()),
                }),
                resource_policy: Some(PodResourcePolicy {
                    container_policies: vec![ContainerResourcePolicy {
                        container_name: "*".into(),
                        controlled_values: Some(CONTROLLED_VALUES_REQUESTS_ONLY.into()),
                        min_allowed: BTreeMap::from([("memory".into(), Quantity("32Mi".into()))]),
                        ..Default::default()
                    }],
                }),
            },
        );
        vpa.metadata.namespace = Some(self.namespace.clone());
        vpa
    }

    pub(super) fn pod_disruption_budget(&self) -> PodDisruptionBudget {
        PodDisruptionBudget {
            metadata: object_meta("kube-state-metrics-pdb", &self.namespace, self.labels()),
            spec: Some(PodDisruptionBudgetSpec {
                max_unavailable: Some(IntOrString::Int(1)),
                selector: Some(label_selector(self.labels())),
                unhealthy_pod_eviction_policy: self
                    .values
                    .kubernetes_version
                    .at_least(1, 26)
                    .then(|| "AlwaysAllow".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn custom_resource_state_config_map(&self, config: &str) -> ConfigMap {
        let mut hasher = sha2::Sha256::new();
        hasher.update(config.as_bytes());
        let digest = hasher.finalize();
        let suffix = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);

        ConfigMap {
            metadata: object_meta(
                &format!("{CUSTOM_RESOURCE_STATE_CONFIG_MAP_NAME}-{suffix:x}"),
                &self.namespace,
                BTreeMap::new(),
            ),
            data: Some(BTreeMap::from([(
                CUSTOM_RESOURCE_STATE_CONFIG_MOUNT_FILE.into(),
                config.into(),
            )])),
            immutable: Some(true),
            ..Default::default()
        }
    }

    fn scrape_config(&self, prometheus: &str, spec: ScrapeConfigSpec) -> ScrapeConfig {
        let mut scrape_config = ScrapeConfig::new(&format!("{prometheus}-{NAME}"), spec);
        scrape_config.metadata = config_object_meta(NAME, &self.namespace, prometheus);
        scrape_config
    }

    fn service_discovery(&self) -> Vec<KubernetesSdConfig> {
        vec![KubernetesSdConfig {
            role: "service".into(),
            namespaces: Some(NamespaceDiscovery {
                names: vec![self.namespace.clone()],
            }),
        }]
    }

    fn job_relabelings() -> [RelabelConfig; 2] {
        [
            RelabelConfig {
                action: Some("replace".into()),
                replacement: Some(NAME.into()),
                target_label: Some("job".into()),
                ..Default::default()
            },
            RelabelConfig {
                target_label: Some("instance".into()),
                replacement: Some(NAME.into()),
                ..Default::default()
            },
        ]
    }

    fn keep_metrics_port() -> RelabelConfig {
        RelabelConfig::keep(
            &[
                "__meta_kubernetes_service_label_component",
                "__meta_kubernetes_service_port_name",
            ],
            format!("{LABEL_VALUE_COMPONENT};{PORT_NAME_METRICS}"),
        )
    }

    fn standard_scrape_config_spec(&self) -> ScrapeConfigSpec {
        let mut relabelings = vec![
            Self::keep_metrics_port(),
            RelabelConfig {
                source_labels: vec![format!("__meta_kubernetes_service_label_{LABEL_KEY_TYPE}")],
                regex: Some("(.+)".into()),
                replacement: Some("${1}".into()),
                target_label: Some(LABEL_KEY_TYPE.into()),
                ..Default::default()
            },
        ];
        relabelings.extend(Self::job_relabelings());

        ScrapeConfigSpec {
            kubernetes_sd_configs: self.service_discovery(),
            relabelings,
            metric_relabelings: vec![RelabelConfig::drop(&["pod"], r"^.+\.tf-pod.+$")],
            ..Default::default()
        }
    }

    fn scrape_config_cache(&self) -> ScrapeConfig {
        self.scrape_config(PROMETHEUS_CACHE, self.standard_scrape_config_spec())
    }

    fn scrape_config_shoot(&self) -> ScrapeConfig {
        self.scrape_config(PROMETHEUS_SHOOT, self.standard_scrape_config_spec())
    }

    fn scrape_config_seed(&self) -> ScrapeConfig {
        let mut relabelings = vec![Self::keep_metrics_port()];
        relabelings.extend(Self::job_relabelings());

        self.scrape_config(
            PROMETHEUS_SEED,
            ScrapeConfigSpec {
                kubernetes_sd_configs: self.service_discovery(),
                relabelings,
                metric_relabelings: vec![RelabelConfig::drop(&["namespace"], "shoot-.+")],
                ..Default::default()
            },
        )
    }

    fn scrape_config_garden(&self) -> ScrapeConfig {
        let mut relabelings = vec![Self::keep_metrics_port()];
        relabelings.extend(Self::job_relabelings());

        self.scrape_config(
            PROMETHEUS_GARDEN,
            ScrapeConfigSpec {
                kubernetes_sd_configs: self.service_discovery(),
                relabelings,
                metric_relabelings: vec![
                    RelabelConfig::drop(&["pod"], r"^.+\.tf-pod.+$"),
                    RelabelConfig::drop(&["namespace"], crate::component::GARDEN_NAMESPACE),
                    standard_metric_relabel_config(&[
                        "kube_pod_container_status_restarts_total",
                        "kube_pod_status_phase",
                    ]),
                ],
                ..Default::default()
            },
        )
    }

    pub(super) fn prometheus_rule_shoot(&self) -> PrometheusRule {
        let labels = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        let record = |name: &str, expr: &str| Rule {
            record: Some(name.into()),
            expr: expr.into(),
            ..Default::default()
        };

        let mut rules = vec![Rule {
            alert: Some("KubeStateMetricsSeedDown".into()),
            expr: r#"absent(count({exported_job="kube-state-metrics"}))"#.into(),
            r#for: Some("15m".into()),
            labels: labels(&[
                ("service", "kube-state-metrics-seed"),
                ("severity", "critical"),
                ("type", "seed"),
                ("visibility", "operator"),
            ]),
            annotations: labels(&[
                ("summary", "There are no kube-state-metrics metrics for the control plane"),
                ("description", "Kube-state-metrics is scraped by the cache prometheus and federated by the control plane prometheus. Something is broken in that process."),
            ]),
            ..Default::default()
        }];

        if !self.values.is_workerless {
            rules.extend([
                Rule {
                    alert: Some("KubeStateMetricsShootDown".into()),
                    expr: r#"absent(up{job="kube-state-metrics", type="shoot"} == 1)"#.into(),
                    r#for: Some("15m".into()),
                    labels: labels(&[
                        ("service", "kube-state-metrics-shoot"),
                        ("severity", "info"),
                        ("type", "seed"),
                        ("visibility", "operator"),
                    ]),
                    annotations: labels(&[
                        ("summary", "Kube-state-metrics for shoot cluster metrics is down."),
                        ("description", "There are no running kube-state-metric pods for the shoot cluster. No kubernetes resource metrics can be scraped."),
                    ]),
                    ..Default::default()
                },
                Rule {
                    alert: Some("NoWorkerNodes".into()),
                    expr: "sum(kube_node_spec_unschedulable) == count(kube_node_info) or absent(kube_node_info)".into(),
                    // machine creation timeout plus a grace period for self-healing
                    r#for: Some("25m".into()),
                    labels: labels(&[
                        ("service", "nodes"),
                        ("severity", "blocker"),
                        ("visibility", "all"),
                    ]),
                    annotations: labels(&[
                        ("summary", "No nodes available. Possibly all workloads down."),
                        ("description", "There are no worker nodes in the cluster or all of the worker nodes in the cluster are not schedulable."),
                    ]),
                    ..Default::default()
                },
                record(
                    "shoot:kube_node_status_capacity_cpu_cores:sum",
                    r#"sum(kube_node_status_capacity{resource="cpu",unit="core"})"#,
                ),
                record(
                    "shoot:kube_node_status_capacity_memory_bytes:sum",
                    r#"sum(kube_node_status_capacity{resource="memory",unit="byte"})"#,
                ),
                record(
                    "shoot:machine_types:sum",
                    "sum(kube_node_labels) by (label_beta_kubernetes_io_instance_type)",
                ),
                record(
                    "shoot:node_operating_system:sum",
                    "sum(kube_node_info) by (os_image, kernel_version)",
                ),
                record(
                    "kube_pod_container_resource_limits_cpu_cores",
                    r#"kube_pod_container_resource_limits{resource="cpu", unit="core"}"#,
                ),
                record(
                    "kube_pod_container_resource_requests_cpu_cores",
                    r#"kube_pod_container_resource_requests{resource="cpu", unit="core"}"#,
                ),
                record(
                    "kube_pod_container_resource_limits_memory_bytes",
                    r#"kube_pod_container_resource_limits{resource="memory", unit="byte"}"#,
                ),
                record(
                    "kube_pod_container_resource_requests_memory_bytes",
                    r#"kube_pod_container_resource_requests{resource="memory", unit="byte"}"#,
                ),
            ]);
        }

        let mut rule = PrometheusRule::new(
            &format!("{PROMETHEUS_SHOOT}-{NAME}"),
            PrometheusRuleSpec {
                groups: vec![RuleGroup {
                    name: "kube-state-metrics.rules".into(),
                    rules,
                    ..Default::default()
                }],
            },
        );
        rule.metadata = config_object_meta(NAME, &self.namespace, PROMETHEUS_SHOOT);
        rule
    }
}

/// Projected volume combining the generic token kubeconfig with the shoot access token
fn generic_kubeconfig_volume(generic_token_kubeconfig: &str, access_secret: &str) -> Volume {
    let projection = |secret: &str, key: &str| VolumeProjection {
        secret: Some(SecretProjection {
            name: secret.into(),
            items: Some(vec![KeyToPath {
                key: key.into(),
                path: key.into(),
                ..Default::default()
            }]),
            optional: Some(false),
        }),
        ..Default::default()
    };

    Volume {
        name: VOLUME_NAME_KUBECONFIG.into(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(420),
            sources: Some(vec![
                projection(generic_token_kubeconfig, "kubeconfig"),
                projection(access_secret, "token"),
            ]),
        }),
        ..Default::default()
    }
}
