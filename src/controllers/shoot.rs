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
use crate::botanist::Botanist;
use crate::config::Config;
use crate::images::ImageVector;
use crate::resources::shoots::{Shoot, SHOOT_FINALIZER};
use crate::{telemetry, Error, Metrics, Result};

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
            recorder: Recorder::new(client, "gardenlet-shoot".into()),
            config: state.config,
            image_vector: state.image_vector,
            metrics,
            diagnostics: state.diagnostics,
        })
    }

    fn botanist(&self, shoot: Arc<Shoot>) -> Result<Botanist> {
        Botanist::new(
            self.client.clone(),
            self.config.clone(),
            self.image_vector.clone(),
            shoot,
        )
    }
}

#[instrument(skip(ctx, shoot), fields(trace_id))]
async fn reconcile(shoot: Arc<Shoot>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<Shoot>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let Some(namespace) = shoot.namespace() else {
        return Ok(Action::await_change());
    };
    let shoots: Api<Shoot> = Api::namespaced(ctx.client.clone(), &namespace);

    info!("Reconciling Shoot {}/{}", namespace, shoot.name_any());
    match finalizer(&shoots, SHOOT_FINALIZER, shoot.clone(), |event| async {
        match event {
            Finalizer::Apply(shoot) => reconcile_shoot(shoot, ctx.clone()).await,
            Finalizer::Cleanup(shoot) => cleanup_shoot(shoot, ctx.clone()).await,
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
                    &shoot.object_ref(&()),
                )
                .await?;

            let err = Error::FinalizerError(Box::new(err));
            ctx.metrics.reconcile_failure(shoot.as_ref(), &err);
            Err(err)
        }
    }
}

async fn reconcile_shoot(shoot: Arc<Shoot>, ctx: Arc<Context>) -> Result<Action> {
    let botanist = ctx.botanist(shoot.clone())?;
    debug!("Deploying control plane components into {}", botanist.namespace());

    botanist.deploy_kube_state_metrics().await?;
    botanist.deploy_operator_grafana().await?;
    botanist.deploy_seed_logging().await?;

    Ok(Action::requeue(ctx.config.sync_period))
}

// Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
async fn cleanup_shoot(shoot: Arc<Shoot>, ctx: Arc<Context>) -> Result<Action> {
    ctx.recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", shoot.name_any())),
                action: "Deleting".into(),
                secondary: None,
            },
            &shoot.object_ref(&()),
        )
        .await?;

    // a shoot without a technical ID never got anything deployed
    if shoot.seed_namespace().is_none() {
        return Ok(Action::await_change());
    }
    ctx.botanist(shoot)?.destroy().await?;
    Ok(Action::await_change())
}

/// Run the Shoot controller for shoots scheduled onto this seed
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let shoots: Api<Shoot> = Api::all(client.clone());

    if let Err(e) = shoots.list(&ListParams::default().limit(1)).await {
        error!("Shoot is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    let cfg =
        watcher::Config::default().fields(&format!("spec.seedName={}", state.config.seed_name));
    let (reader, writer) = reflector::store();
    let stream = watcher(shoots, cfg)
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
    use crate::fixtures::{mock_client, not_found_status, success_status};
    use crate::resources::shoots::{ShootKubernetes, ShootSpec, ShootStatus};
    use http::{Method, Response, StatusCode};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::client::Body;
    use serde_json::Value;

    const SHOOT_PATH: &str = "/apis/core.gardener.cloud/v1beta1/namespaces/garden-foo/shoots/bar";

    #[tokio::test]
    async fn shoot_without_technical_id_is_not_reconciled() {
        let (client, _server) = mock_client();
        let config: Config = "--seed-name local".parse().unwrap();
        let ctx = Context::new(
            client,
            Metrics::default(),
            State::new(config, ImageVector::builtin().unwrap()),
        );
        let shoot = Shoot::new(
            "bar",
            ShootSpec {
                kubernetes: ShootKubernetes {
                    version: "1.28.2".into(),
                },
                ..Default::default()
            },
        );

        let err = reconcile_shoot(Arc::new(shoot), ctx).await.unwrap_err();
        assert_eq!(err.metric_label(), "MissingTechnicalId");
    }

    #[tokio::test]
    async fn deleted_shoot_is_cleaned_up_before_finalizer_removal() {
        let (client, mut server) = mock_client();
        let config: Config = "--seed-name local".parse().unwrap();
        let ctx = Context::new(
            client,
            Metrics::default(),
            State::new(config, ImageVector::builtin().unwrap()),
        );
        let mut shoot = Shoot::new(
            "bar",
            ShootSpec {
                kubernetes: ShootKubernetes {
                    version: "1.28.2".into(),
                },
                ..Default::default()
            },
        );
        shoot.metadata.namespace = Some("garden-foo".into());
        shoot.metadata.finalizers = Some(vec![SHOOT_FINALIZER.into()]);
        shoot.metadata.deletion_timestamp = Some(Time(Utc::now()));
        shoot.status = Some(ShootStatus {
            technical_id: Some("shoot--foo--bar".into()),
            ..Default::default()
        });
        let mut released = shoot.clone();
        released.metadata.finalizers = None;

        let server = tokio::spawn(async move {
            let mut calls = Vec::new();
            loop {
                let (request, send) = server.next_raw().await;
                let method = request.method().clone();
                let path = request.uri().path().to_string();
                let bytes = request.into_body().collect_bytes().await.unwrap();
                calls.push(format!("{method} {path}"));

                let (status, body) = if method == Method::POST {
                    (StatusCode::CREATED, bytes.to_vec())
                } else if path == SHOOT_PATH {
                    let patch: Value = serde_json::from_slice(&bytes).unwrap();
                    assert_eq!(patch[1]["op"], "remove");
                    assert_eq!(patch[1]["path"], "/metadata/finalizers/0");
                    (StatusCode::OK, serde_json::to_vec(&released).unwrap())
                } else if path.ends_with("/configmaps") {
                    (StatusCode::OK, serde_json::to_vec(&success_status()).unwrap())
                } else {
                    (StatusCode::NOT_FOUND, serde_json::to_vec(&not_found_status()).unwrap())
                };
                send.send_response(Response::builder().status(status).body(Body::from(body)).unwrap());

                if path == SHOOT_PATH {
                    return calls;
                }
            }
        });

        let action = reconcile(Arc::new(shoot), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let calls = server.await.unwrap();
        let position = |call: &str| {
            calls
                .iter()
                .position(|c| c == call)
                .unwrap_or_else(|| panic!("missing {call} in {calls:#?}"))
        };
        assert_eq!(
            calls[0],
            "POST /apis/events.k8s.io/v1/namespaces/garden-foo/events"
        );
        let ksm = position(
            "DELETE /apis/resources.gardener.cloud/v1alpha1/namespaces/shoot--foo--bar/managedresources/shoot-core-kube-state-metrics",
        );
        let ksm_access = position(
            "DELETE /api/v1/namespaces/shoot--foo--bar/secrets/shoot-access-kube-state-metrics",
        );
        let grafana = position(
            "DELETE /apis/resources.gardener.cloud/v1alpha1/namespaces/shoot--foo--bar/managedresources/operatorgrafana",
        );
        let vali = position("DELETE /apis/apps/v1/namespaces/shoot--foo--bar/statefulsets/vali");
        let grafana_gone = position(
            "GET /apis/resources.gardener.cloud/v1alpha1/namespaces/shoot--foo--bar/managedresources/operatorgrafana",
        );
        assert!(ksm < ksm_access && ksm_access < grafana);
        assert!(grafana < vali && vali < grafana_gone);
        assert_eq!(calls.last().unwrap(), &format!("PATCH {SHOOT_PATH}"));
        assert!(calls.iter().all(|c| !c.contains("kube-state-metrics2")));
    }
}
