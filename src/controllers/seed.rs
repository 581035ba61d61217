use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use tokio::sync::RwLock;
use tracing::*;

use super::{error_policy, spec_predicate, Diagnostics, State};
use crate::component::istio::{self, IngressGateway, Istio, IstiodValues, ProxyProtocol};
use crate::component::kubestatemetrics::{self, KubeStateMetrics};
use crate::component::prometheus_cache::PrometheusCacheRules;
use crate::component::vali::delete_seed_logging_stack;
use crate::component::{ClusterType, DeployWaiter, LABEL_APP};
use crate::config::Config;
use crate::images::{
    ImageVector, IMAGE_NAME_ISTIO_ISTIOD, IMAGE_NAME_ISTIO_PROXY, IMAGE_NAME_KUBE_STATE_METRICS,
};
use crate::migration::{
    cleanup_legacy_priority_classes, resize_or_delete_vali_data_volume, MigrationOptions,
};
use crate::resources::seeds::{Seed, SEED_FINALIZER};
use crate::utils::version::KubernetesVersion;
use crate::{telemetry, Error, Metrics, Result};

pub const PRIORITY_CLASS_SEED_SYSTEM_600: &str = "gardener-system-600";
pub const ISTIO_INGRESS_NAMESPACE: &str = "istio-ingress";
const ISTIO_TRUST_DOMAIN: &str = "cluster.local";

pub(super) struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    pub config: Arc<Config>,
    pub image_vector: Arc<ImageVector>,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            recorder: Recorder::new(client, "gardenlet-seed".into()),
            config: state.config,
            image_vector: state.image_vector,
            metrics,
            diagnostics: state.diagnostics,
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

    let seeds: Api<Seed> = Api::all(ctx.client.clone());

    info!("Reconciling Seed {}", seed.name_any());
    match finalizer(&seeds, SEED_FINALIZER, seed.clone(), |event| async {
        match event {
            Finalizer::Apply(seed) => seed.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(seed) => seed.cleanup(ctx.clone()).await,
        }
    })
    .await
    {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &seed.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(seed.as_ref(), &err);
            Err(err)
        }
    }
}

/// The system components this gardenlet deploys into its own seed
struct SeedComponents {
    kube_state_metrics: KubeStateMetrics,
    /// Without istiod when the seed is also the garden cluster
    istio: Istio,
    cache_rules: PrometheusCacheRules,
}

impl SeedComponents {
    fn new(ctx: &Context, version: KubernetesVersion) -> Result<Self> {
        let config = &ctx.config;
        let image = |name: &str| -> Result<String> {
            Ok(ctx.image_vector.find_image(name, Some(version), Some(version))?.image())
        };

        let kube_state_metrics = KubeStateMetrics::new(
            ctx.client.clone(),
            &config.garden_namespace,
            kubestatemetrics::Values {
                cluster_type: ClusterType::Seed,
                kubernetes_version: version,
                image: image(IMAGE_NAME_KUBE_STATE_METRICS)?,
                priority_class_name: PRIORITY_CLASS_SEED_SYSTEM_600.into(),
                replicas: 1,
                is_workerless: false,
                generic_token_kubeconfig_secret_name: None,
            },
        );

        let gateway_labels = BTreeMap::from([
            (LABEL_APP.to_string(), "istio-ingressgateway".to_string()),
            ("istio".into(), "ingressgateway".into()),
        ]);
        let istio = Istio::new(
            ctx.client.clone(),
            istio::ISTIO_SYSTEM_NAMESPACE,
            IstiodValues {
                trust_domain: ISTIO_TRUST_DOMAIN.into(),
                image: image(IMAGE_NAME_ISTIO_ISTIOD)?,
                ..Default::default()
            },
            vec![IngressGateway {
                namespace: ISTIO_INGRESS_NAMESPACE.into(),
                image: image(IMAGE_NAME_ISTIO_PROXY)?,
                labels: gateway_labels.clone(),
                ..Default::default()
            }],
            vec![ProxyProtocol {
                namespace: ISTIO_INGRESS_NAMESPACE.into(),
                labels: gateway_labels,
            }],
            config.sni_enabled,
        )
        .with_istiod_enabled(!config.seed_is_garden);

        Ok(Self {
            kube_state_metrics,
            istio,
            cache_rules: PrometheusCacheRules::with_namespace(
                ctx.client.clone(),
                &config.garden_namespace,
            ),
        })
    }

    async fn deploy(&self) -> Result<()> {
        self.kube_state_metrics.deploy().await?;
        self.istio.deploy().await?;
        self.cache_rules.deploy().await?;

        self.kube_state_metrics.wait().await?;
        self.istio.wait().await?;
        self.cache_rules.wait().await
    }

    async fn destroy(&self) -> Result<()> {
        self.cache_rules.destroy().await?;
        self.istio.destroy().await?;
        self.kube_state_metrics.destroy().await?;

        self.cache_rules.wait_cleanup().await?;
        self.istio.wait_cleanup().await?;
        self.kube_state_metrics.wait_cleanup().await
    }
}

async fn seed_version(client: &Client) -> Result<KubernetesVersion> {
    client.apiserver_version().await?.git_version.parse()
}

impl Seed {
    // Reconcile (for non-finalizer related changes)
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let config = &ctx.config;

        cleanup_legacy_priority_classes(&ctx.client).await?;

        if !config.logging_enabled {
            delete_seed_logging_stack(&ctx.client).await?;
        } else if config.vali_enabled {
            resize_or_delete_vali_data_volume(
                &ctx.client,
                &config.garden_vali_storage,
                &MigrationOptions::default(),
            )
            .await?;
        }

        let version = seed_version(&ctx.client).await?;
        SeedComponents::new(&ctx, version)?.deploy().await?;

        ctx.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "Reconciled".into(),
                    note: Some(format!("System components of seed `{}` deployed", self.name_any())),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await?;

        Ok(Action::requeue(config.sync_period))
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        ctx.recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!("Delete `{}`", self.name_any())),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await?;

        let version = seed_version(&ctx.client).await?;
        SeedComponents::new(&ctx, version)?.destroy().await?;
        Ok(Action::await_change())
    }
}

/// Run the Seed controller for the seed named in the configuration
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let seeds: Api<Seed> = Api::all(client.clone());

    if let Err(e) = seeds.list(&ListParams::default().limit(1)).await {
        error!("Seed is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

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

    fn context(client: Client, args: &str) -> Arc<Context> {
        let config: Config = format!("--seed-name local {args}").parse().unwrap();
        let state = State::new(config, ImageVector::builtin().unwrap());
        Context::new(client, Metrics::default(), state)
    }

    #[tokio::test]
    async fn istiod_is_skipped_when_seed_is_garden() {
        let (client, _server) = mock_client();
        let version = KubernetesVersion::new(1, 28, 2);

        let components = SeedComponents::new(&context(client.clone(), ""), version).unwrap();
        assert!(components.istio.istiod_enabled());
        assert_eq!(components.kube_state_metrics.managed_resource_name(), "kube-state-metrics");

        let components =
            SeedComponents::new(&context(client, "--seed-is-garden true"), version).unwrap();
        assert!(!components.istio.istiod_enabled());
    }

    #[tokio::test]
    async fn seed_images_follow_the_seed_version() {
        let (client, _server) = mock_client();
        let ctx = context(client, "");
        let image = |version| {
            SeedComponents::new(&ctx, version)
                .unwrap()
                .kube_state_metrics
                .values()
                .image
                .clone()
        };
        assert!(image(KubernetesVersion::new(1, 25, 0)).ends_with(":v2.8.2"));
        assert!(image(KubernetesVersion::new(1, 28, 2)).ends_with(":v2.10.1"));
    }

    #[tokio::test]
    async fn missing_image_fails_early() {
        let (client, _server) = mock_client();
        let config: Config = "--seed-name local".parse().unwrap();
        let state = State::new(config, ImageVector::default());
        let ctx = Context::new(client, Metrics::default(), state);
        let err = SeedComponents::new(&ctx, KubernetesVersion::new(1, 28, 2))
            .err()
            .unwrap();
        assert_eq!(err.metric_label(), "ImageNotFound");
    }
}
