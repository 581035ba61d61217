use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::*;

use crate::images::ImageVector;
use crate::{Config, Error, Metrics};

pub mod seed;
pub mod seedcare;
pub mod shoot;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub seed_name: String,
}

impl Diagnostics {
    fn new(seed_name: String) -> Self {
        Self {
            last_event: Utc::now(),
            seed_name,
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    config: Arc<Config>,
    image_vector: Arc<ImageVector>,
}

impl State {
    pub fn new(config: Config, image_vector: ImageVector) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(config.seed_name.clone()))),
            registry: prometheus::Registry::default(),
            config: Arc::new(config),
            image_vector: Arc::new(image_vector),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Changes worth a reconcile: the spec (via the generation), finalizers and deletion.
/// Status updates, including our own condition updates, are ignored.
fn spec_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    obj.meta().generation.hash(&mut hasher);
    obj.finalizers().hash(&mut hasher);
    obj.meta().deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

/// Run all controllers of this gardenlet until shutdown
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");
    let metrics = Metrics::default()
        .register(&state.registry)
        .expect("metrics are registered once");

    info!("Starting controllers for seed {}", state.config.seed_name);
    tokio::join!(
        seed::run(client.clone(), metrics.clone(), state.clone()),
        seedcare::run(client.clone(), metrics.clone(), state.clone()),
        shoot::run(client, metrics, state),
    );
}

fn error_policy<K, C>(_obj: Arc<K>, _: &Error, _ctx: C) -> Action {
    Action::requeue(Duration::from_secs(30))
}
