//! Health of the system components a seed runs for itself.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tracing::*;

use super::{get_or_init_condition, new_condition_or_error, updated_condition, HealthChecker};
use crate::component::{istio, vali, GARDEN_NAMESPACE, KUBE_SYSTEM_NAMESPACE};
use crate::resources::core::{Condition, CONDITION_TRUE, SEED_SYSTEM_COMPONENTS_HEALTHY};
use crate::resources::managedresources::ManagedResource;
use crate::resources::seeds::{Seed, SeedStatus};
use crate::Result;

const REQUIRED_MANAGED_RESOURCES: &[&str] = &[
    "cluster-autoscaler",
    "etcd-druid",
    "kube-state-metrics",
    "nginx-ingress",
    "system",
    "vpa",
];

pub const MANAGED_RESOURCE_CLUSTER_IDENTITY: &str = "cluster-identity";
pub const MANAGED_RESOURCE_DWD_WEEDER: &str = "dependency-watchdog-weeder";
pub const MANAGED_RESOURCE_DWD_PROBER: &str = "dependency-watchdog-prober";
pub const MANAGED_RESOURCES_FLUENT_OPERATOR: &[&str] = &[
    "fluent-operator",
    "fluent-operator-custom-resources",
    "fluent-bit",
];

const CLUSTER_IDENTITY: &str = "cluster-identity";
const CLUSTER_IDENTITY_ORIGIN: &str = "origin";
const CLUSTER_IDENTITY_ORIGIN_SEED: &str = "seed";

const PROMETHEUS_STATEFUL_SET: &str = "prometheus";
const REASON_RESOURCE_NOT_FOUND: &str = "ResourceNotFound";

/// Conditions maintained on `Seed.status`
#[derive(Clone, Debug)]
pub struct SeedConditions {
    pub system_components_healthy: Condition,
}

impl SeedConditions {
    pub fn new(status: Option<&SeedStatus>, health: &HealthChecker) -> Self {
        let conditions = status.map(|s| s.conditions.as_slice()).unwrap_or_default();
        Self {
            system_components_healthy: get_or_init_condition(
                conditions,
                SEED_SYSTEM_COMPONENTS_HEALTHY,
                health.now(),
            ),
        }
    }

    pub fn into_vec(self) -> Vec<Condition> {
        vec![self.system_components_healthy]
    }
}

/// Checks the system components of one seed
pub struct SeedHealth<'a> {
    client: Client,
    seed: &'a Seed,
    /// Overrides the namespace of every checked object
    namespace: Option<String>,
    seed_is_garden: bool,
    logging_enabled: bool,
    vali_enabled: bool,
    checker: HealthChecker,
}

impl<'a> SeedHealth<'a> {
    pub fn new(
        client: Client,
        seed: &'a Seed,
        namespace: Option<String>,
        seed_is_garden: bool,
        logging_enabled: bool,
        vali_enabled: bool,
        checker: HealthChecker,
    ) -> Self {
        Self {
            client,
            seed,
            namespace,
            seed_is_garden,
            logging_enabled,
            vali_enabled,
            checker,
        }
    }

    /// Runs every check and returns the resulting conditions
    pub async fn check(&self, conditions: SeedConditions) -> Vec<Condition> {
        let old = conditions.system_components_healthy;
        let new = self.check_system_components(&old).await;
        if let Err(err) = &new {
            warn!("Checking system components of seed failed: {err}");
        }
        vec![new_condition_or_error(self.checker.now(), &old, new)]
    }

    /// Names of the ManagedResources that must exist and be healthy, with their namespaces
    pub async fn managed_resources(&self) -> Result<Vec<(String, &'static str)>> {
        let mut names: Vec<&'static str> = REQUIRED_MANAGED_RESOURCES.to_vec();
        names.extend(istio::managed_resource_names(!self.seed_is_garden));

        if self.is_cluster_identity_origin().await? {
            names.push(MANAGED_RESOURCE_CLUSTER_IDENTITY);
        }
        if self.seed.dependency_watchdog_weeder_enabled() {
            names.push(MANAGED_RESOURCE_DWD_WEEDER);
        }
        if self.seed.dependency_watchdog_prober_enabled() {
            names.push(MANAGED_RESOURCE_DWD_PROBER);
        }
        if self.logging_enabled {
            names.extend(MANAGED_RESOURCES_FLUENT_OPERATOR);
        }
        if self.vali_enabled {
            names.push(vali::NAME);
        }

        let istio_names = istio::managed_resource_names(true);
        Ok(names
            .into_iter()
            .map(|name| {
                let default = if istio_names.contains(&name) {
                    istio::ISTIO_SYSTEM_NAMESPACE
                } else {
                    GARDEN_NAMESPACE
                };
                (self.namespace.as_deref().unwrap_or(default).to_string(), name)
            })
            .collect())
    }

    /// The cluster identity is owned by the seed when it is unset or was set by a seed
    async fn is_cluster_identity_origin(&self) -> Result<bool> {
        let config_maps: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), KUBE_SYSTEM_NAMESPACE);
        let Some(cm) = config_maps.get_opt(CLUSTER_IDENTITY).await? else {
            return Ok(true);
        };
        let origin = cm
            .data
            .as_ref()
            .and_then(|d| d.get(CLUSTER_IDENTITY_ORIGIN))
            .map(String::as_str)
            .unwrap_or_default();
        Ok(origin.is_empty() || origin == CLUSTER_IDENTITY_ORIGIN_SEED)
    }

    async fn check_system_components(&self, condition: &Condition) -> Result<Condition> {
        for (namespace, name) in self.managed_resources().await? {
            let mrs: Api<ManagedResource> = Api::namespaced(self.client.clone(), &namespace);
            let Some(mr) = mrs.get_opt(name).await? else {
                return Ok(self.checker.failed(
                    condition,
                    REASON_RESOURCE_NOT_FOUND,
                    &format!("managedresources.resources.gardener.cloud \"{name}\" not found"),
                ));
            };
            if let Some(failed) = self.checker.check_managed_resource(condition, &mr) {
                return Ok(failed);
            }
        }

        let stateful_sets: Api<StatefulSet> = Api::namespaced(self.client.clone(), GARDEN_NAMESPACE);
        let Some(prometheus) = stateful_sets.get_opt(PROMETHEUS_STATEFUL_SET).await? else {
            return Ok(self.checker.failed(
                condition,
                REASON_RESOURCE_NOT_FOUND,
                &format!("statefulsets.apps \"{PROMETHEUS_STATEFUL_SET}\" not found"),
            ));
        };
        if let Some(failed) = self.checker.check_stateful_sets(condition, &[prometheus]) {
            return Ok(failed);
        }

        Ok(updated_condition(
            condition,
            CONDITION_TRUE,
            "SystemComponentsRunning",
            "All system components are healthy.",
            Vec::new(),
            self.checker.now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::mock_client;
    use crate::health::ConditionThresholds;
    use crate::resources::seeds::SeedSpec;
    use chrono::{TimeZone, Utc};
    use http::Method;
    use serde_json::json;

    fn checker() -> HealthChecker {
        HealthChecker::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ConditionThresholds::new(),
            None,
        )
    }

    fn healthy_mr(namespace: &str, name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "resources.gardener.cloud/v1alpha1",
            "kind": "ManagedResource",
            "metadata": {"name": name, "namespace": namespace, "generation": 1},
            "spec": {},
            "status": {
                "observedGeneration": 1,
                "conditions": [
                    {"type": "ResourcesApplied", "status": "True"},
                    {"type": "ResourcesHealthy", "status": "True"},
                    {"type": "ResourcesProgressing", "status": "False"}
                ]
            }
        })
    }

    #[tokio::test]
    async fn managed_resource_names_follow_settings() {
        let (client, mut server) = mock_client();
        let seed = Seed::new("local", SeedSpec::default());
        let health = SeedHealth::new(client, &seed, None, false, true, true, checker());

        let server = tokio::spawn(async move {
            server
                .ok(
                    Method::GET,
                    "/api/v1/namespaces/kube-system/configmaps/cluster-identity",
                    json!({
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "metadata": {"name": "cluster-identity", "namespace": "kube-system"},
                        "data": {"cluster-identity": "foo", "origin": "gardener-apiserver"}
                    }),
                )
                .await;
        });

        let names = health.managed_resources().await.unwrap();
        server.await.unwrap();

        let names: Vec<(&str, &str)> = names.iter().map(|(ns, n)| (ns.as_str(), *n)).collect();
        assert_eq!(
            names,
            vec![
                ("garden", "cluster-autoscaler"),
                ("garden", "etcd-druid"),
                ("garden", "kube-state-metrics"),
                ("garden", "nginx-ingress"),
                ("garden", "system"),
                ("garden", "vpa"),
                ("istio-system", "istio"),
                ("istio-system", "istio-system"),
                ("garden", "dependency-watchdog-weeder"),
                ("garden", "dependency-watchdog-prober"),
                ("garden", "fluent-operator"),
                ("garden", "fluent-operator-custom-resources"),
                ("garden", "fluent-bit"),
                ("garden", "vali"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_managed_resource_fails_condition() {
        let (client, mut server) = mock_client();
        let seed = Seed::new("local", SeedSpec::default());
        let health = SeedHealth::new(
            client,
            &seed,
            Some("test".into()),
            true,
            false,
            false,
            checker(),
        );
        let conditions = SeedConditions::new(None, &health.checker);

        let server = tokio::spawn(async move {
            server
                .not_found(
                    Method::GET,
                    "/api/v1/namespaces/kube-system/configmaps/cluster-identity",
                )
                .await;
            server
                .ok(
                    Method::GET,
                    "/apis/resources.gardener.cloud/v1alpha1/namespaces/test/managedresources/cluster-autoscaler",
                    healthy_mr("test", "cluster-autoscaler"),
                )
                .await;
            server
                .not_found(
                    Method::GET,
                    "/apis/resources.gardener.cloud/v1alpha1/namespaces/test/managedresources/etcd-druid",
                )
                .await;
        });

        let conditions = health.check(conditions).await;
        server.await.unwrap();

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].r#type, "SeedSystemComponentsHealthy");
        assert_eq!(conditions[0].status, "False");
        assert_eq!(conditions[0].reason.as_deref(), Some("ResourceNotFound"));
    }

    #[tokio::test]
    async fn all_healthy_sets_condition_true() {
        let (client, mut server) = mock_client();
        let seed: Seed = serde_json::from_value(json!({
            "apiVersion": "core.gardener.cloud/v1beta1",
            "kind": "Seed",
            "metadata": {"name": "local"},
            "spec": {"settings": {"dependencyWatchdog": {
                "weeder": {"enabled": false},
                "prober": {"enabled": false}
            }}}
        }))
        .unwrap();
        let health = SeedHealth::new(client, &seed, None, true, false, false, checker());
        let conditions = SeedConditions::new(None, &health.checker);

        let server = tokio::spawn(async move {
            server
                .ok(
                    Method::GET,
                    "/api/v1/namespaces/kube-system/configmaps/cluster-identity",
                    json!({
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "metadata": {"name": "cluster-identity", "namespace": "kube-system"},
                        "data": {"origin": "seed"}
                    }),
                )
                .await;
            for (namespace, name) in [
                ("garden", "cluster-autoscaler"),
                ("garden", "etcd-druid"),
                ("garden", "kube-state-metrics"),
                ("garden", "nginx-ingress"),
                ("garden", "system"),
                ("garden", "vpa"),
                ("istio-system", "istio-system"),
                ("garden", "cluster-identity"),
            ] {
                server
                    .ok(
                        Method::GET,
                        &format!("/apis/resources.gardener.cloud/v1alpha1/namespaces/{namespace}/managedresources/{name}"),
                        healthy_mr(namespace, name),
                    )
                    .await;
            }
            server
                .ok(
                    Method::GET,
                    "/apis/apps/v1/namespaces/garden/statefulsets/prometheus",
                    json!({
                        "apiVersion": "apps/v1",
                        "kind": "StatefulSet",
                        "metadata": {"name": "prometheus", "namespace": "garden", "generation": 1},
                        "spec": {
                            "replicas": 1,
                            "selector": {},
                            "serviceName": "prometheus",
                            "template": {}
                        },
                        "status": {"replicas": 1, "observedGeneration": 1, "readyReplicas": 1}
                    }),
                )
                .await;
        });

        let conditions = health.check(conditions).await;
        server.await.unwrap();

        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason.as_deref(), Some("SystemComponentsRunning"));
        assert_eq!(
            conditions[0].message.as_deref(),
            Some("All system components are healthy.")
        );
    }
}
