//! Central recording rules evaluated by the seed's cache Prometheus.

use std::collections::BTreeMap;

use kube::Client;

use super::managedresources;
use super::{object_meta, DeployWaiter, Registry, GARDEN_NAMESPACE};
use crate::resources::monitoring::{PrometheusRule, PrometheusRuleSpec};
use crate::Result;

pub const MANAGED_RESOURCE_NAME: &str = "prometheus-cache-rules";
const PROMETHEUS_NAME: &str = "cache";

const METERING: &str = include_str!("assets/metering.rules.yaml");
const METERING_STATEFUL: &str = include_str!("assets/metering.rules.stateful.yaml");
const RECORDING_RULES: &str = include_str!("assets/recording-rules.rules.yaml");

/// The rule files shipped for the cache Prometheus, as `PrometheusRule` objects in `namespace`
pub fn central_prometheus_rules(namespace: &str) -> Result<Vec<PrometheusRule>> {
    [
        ("metering", METERING),
        ("metering-stateful", METERING_STATEFUL),
        ("recording-rules", RECORDING_RULES),
    ]
    .into_iter()
    .map(|(name, yaml)| {
        let spec: PrometheusRuleSpec = serde_yaml::from_str(yaml)?;
        let mut rule = PrometheusRule::new(name, spec);
        rule.metadata = object_meta(
            name,
            namespace,
            BTreeMap::from([("prometheus".into(), PROMETHEUS_NAME.into())]),
        );
        Ok(rule)
    })
    .collect()
}

pub struct PrometheusCacheRules {
    client: Client,
    namespace: String,
}

impl PrometheusCacheRules {
    pub fn new(client: Client) -> Self {
        Self::with_namespace(client, GARDEN_NAMESPACE)
    }

    pub fn with_namespace(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl DeployWaiter for PrometheusCacheRules {
    async fn deploy(&self) -> Result<()> {
        let mut registry = Registry::new();
        registry.add_all(&central_prometheus_rules(&self.namespace)?)?;
        managedresources::create_for_seed(
            &self.client,
            &self.namespace,
            MANAGED_RESOURCE_NAME,
            false,
            registry.serialized_objects(),
        )
        .await
    }

    async fn destroy(&self) -> Result<()> {
        managedresources::delete_for_seed(&self.client, &self.namespace, MANAGED_RESOURCE_NAME)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::mock_client;
    use http::Method;

    #[test]
    fn rule_files_parse() {
        let rules = central_prometheus_rules("garden").unwrap();
        let names: Vec<_> = rules
            .iter()
            .map(|r| r.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["metering", "metering-stateful", "recording-rules"]
        );

        let stateful = &rules[1].spec.groups[0];
        assert_eq!(stateful.interval.as_deref(), Some("5m"));
        assert!(stateful.rules.iter().all(|r| r.record.is_some()));
        assert!(rules
            .iter()
            .flat_map(|r| &r.spec.groups)
            .flat_map(|g| &g.rules)
            .all(|r| !r.expr.is_empty()));
    }

    #[tokio::test]
    async fn deploy_creates_seed_managed_resource() {
        let (client, mut server) = mock_client();

        let server = tokio::spawn(async move {
            let secret = server
                .echo(
                    Method::PATCH,
                    "/api/v1/namespaces/garden/secrets/managedresource-prometheus-cache-rules",
                )
                .await;
            let keys: Vec<_> = secret["data"].as_object().unwrap().keys().cloned().collect();
            assert_eq!(
                keys,
                vec![
                    "prometheusrule__garden__metering-stateful.yaml",
                    "prometheusrule__garden__metering.yaml",
                    "prometheusrule__garden__recording-rules.yaml",
                ]
            );
            let mr = server
                .echo(
                    Method::PATCH,
                    "/apis/resources.gardener.cloud/v1alpha1/namespaces/garden/managedresources/prometheus-cache-rules",
                )
                .await;
            assert_eq!(mr["spec"]["class"], "seed");
        });

        PrometheusCacheRules::new(client).deploy().await.unwrap();
        server.await.unwrap();
    }
}
