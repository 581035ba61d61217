//! Periodic health checks of the seed's system components, reported as `Seed` conditions.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::*;

use super::{error_policy, spec_predicate, Diagnostics, State};
use crate::config::Config;
use crate::health::seed::{SeedConditions, SeedHealth};
use crate::health::{merge_conditions, HealthChecker};
use crate::resources::seeds::Seed;
use crate::{telemetry, Metrics, Result, FIELD_MANAGER};

pub(super) struct Context {
    pub client: Client,
    pub config: Arc<Config>,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            client,
            config: state.config,
            diagnostics: state.diagnostics,
            metrics,
        })
    }
}

#[instrument(skip(ctx, seed), fields(trace_id))]
async fn reconcile(seed: Arc<Seed>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Seed>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    if seed.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    match seed.care(&ctx).await {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("seed care failed: {:?}", err);
            ctx.metrics.reconcile_failure(seed.as_ref(), &err);
            Err(err)
        }
    }
}

impl Seed {
    async fn care(&self, ctx: &Context) -> Result<Action> {
        let config = &ctx.config;
        let checker = HealthChecker::new(
            Utc::now(),
            config.condition_thresholds(),
            self.last_operation().cloned(),
        );
        let conditions = SeedConditions::new(self.status.as_ref(), &checker);
        let health = SeedHealth::new(
            ctx.client.clone(),
            self,
            None,
            config.seed_is_garden,
            config.logging_enabled,
            config.vali_enabled,
            checker,
        );

        let updated = health.check(conditions).await;
        for condition in &updated {
            debug!("Seed {} condition {condition}", self.name_any());
        }
        ctx.metrics.observe_conditions(self, &updated);

        let seeds: Api<Seed> = Api::all(ctx.client.clone());
        let new_status = Patch::Apply(json!({
            "apiVersion": "core.gardener.cloud/v1beta1",
            "kind": "Seed",
            "status": {
                "conditions": merge_conditions(self.conditions(), updated),
            }
        }));
        let ps = PatchParams::apply(FIELD_MANAGER).force();
        seeds.patch_status(&self.name_any(), &ps, &new_status).await?;

        Ok(Action::requeue(config.care_sync_period))
    }
}

/// Run the seed care controller for the seed named in the configuration
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let seeds: Api<Seed> = Api::all(client.clone());

    let cfg = watcher::Config::default().fields(&format!("metadata.name={}", state.config.seed_name));
    let (reader, writer) = reflector::store();
    let stream = watcher(seeds, cfg)
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(spec_predicate);

    Controller::for_stream(stream, reader)
        .shutdown_on_signal()
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::mock_client;
    use crate::images::ImageVector;
    use crate::resources::core::Condition;
    use crate::resources::seeds::{SeedSpec, SeedStatus};
    use http::Method;

    const MR_PATH: &str = "/apis/resources.gardener.cloud/v1alpha1/namespaces/garden/managedresources";

    #[tokio::test]
    async fn missing_component_is_reported_on_seed_status() {
        let (client, mut server) = mock_client();
        let config: Config = "--seed-name local".parse().unwrap();
        let ctx = Context::new(
            client,
            Metrics::default(),
            State::new(config, ImageVector::default()),
        );
        let mut seed = Seed::new("local", SeedSpec::default());
        seed.status = Some(SeedStatus {
            conditions: vec![Condition {
                r#type: "Other".into(),
                status: "True".into(),
                ..Default::default()
            }],
            ..Default::default()
        });

        let server = tokio::spawn(async move {
            server
                .not_found(
                    Method::GET,
                    "/api/v1/namespaces/kube-system/configmaps/cluster-identity",
                )
                .await;
            server
                .not_found(Method::GET, &format!("{MR_PATH}/cluster-autoscaler"))
                .await;
            let patch = server
                .ok(
                    Method::PATCH,
                    "/apis/core.gardener.cloud/v1beta1/seeds/local/status",
                    json!({
                        "apiVersion": "core.gardener.cloud/v1beta1",
                        "kind": "Seed",
                        "metadata": {"name": "local"},
                        "spec": {}
                    }),
                )
                .await;
            let conditions = patch["status"]["conditions"].as_array().unwrap().clone();
            assert_eq!(conditions.len(), 2);
            assert_eq!(conditions[0]["type"], "Other");
            assert_eq!(conditions[1]["type"], "SeedSystemComponentsHealthy");
            assert_eq!(conditions[1]["status"], "False");
            assert_eq!(conditions[1]["reason"], "ResourceNotFound");
        });

        let action = seed.care(&ctx).await.unwrap();
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(30)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn care_replaces_existing_condition_in_place() {
        let (client, mut server) = mock_client();
        let config: Config = "--seed-name local".parse().unwrap();
        let ctx = Context::new(
            client,
            Metrics::default(),
            State::new(config, ImageVector::default()),
        );
        let mut seed = Seed::new("local", SeedSpec::default());
        seed.status = Some(
            serde_json::from_value(json!({
                "conditions": [
                    {
                        "type": "SeedSystemComponentsHealthy",
                        "status": "True",
                        "lastTransitionTime": "2020-01-01T00:00:00Z",
                        "lastUpdateTime": "2020-01-01T00:00:00Z",
                        "reason": "SystemComponentsRunning",
                        "message": "All system components are healthy."
                    },
                    {
                        "type": "Other",
                        "status": "True",
                        "lastTransitionTime": "2020-01-01T00:00:00Z",
                        "reason": "Fine"
                    }
                ]
            }))
            .unwrap(),
        );

        let server = tokio::spawn(async move {
            server
                .not_found(
                    Method::GET,
                    "/api/v1/namespaces/kube-system/configmaps/cluster-identity",
                )
                .await;
            server
                .not_found(Method::GET, &format!("{MR_PATH}/cluster-autoscaler"))
                .await;
            let patch = server
                .ok(
                    Method::PATCH,
                    "/apis/core.gardener.cloud/v1beta1/seeds/local/status",
                    json!({
                        "apiVersion": "core.gardener.cloud/v1beta1",
                        "kind": "Seed",
                        "metadata": {"name": "local"},
                        "spec": {}
                    }),
                )
                .await;
            let conditions = patch["status"]["conditions"].as_array().unwrap().clone();
            assert_eq!(conditions.len(), 2);
            assert_eq!(conditions[0]["type"], "SeedSystemComponentsHealthy");
            assert_eq!(conditions[0]["status"], "False");
            assert_eq!(conditions[0]["reason"], "ResourceNotFound");
            assert_ne!(conditions[0]["lastTransitionTime"], "2020-01-01T00:00:00Z");
            assert_eq!(conditions[1]["type"], "Other");
            assert_eq!(conditions[1]["status"], "True");
            assert_eq!(conditions[1]["reason"], "Fine");
            assert_eq!(conditions[1]["lastTransitionTime"], "2020-01-01T00:00:00Z");
        });

        let action = seed.care(&ctx).await.unwrap();
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(30)));
        server.await.unwrap();
    }
}
