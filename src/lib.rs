use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Component is not yet Ready: {message}")]
    NotReady {
        message: String,
        reason: String,
        requeue_after: Option<Duration>,
    },

    #[error("Timed out after {timeout:?} waiting for {what}: {last_error}")]
    Timeout {
        what: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("The Secret {0} does not exist")]
    SecretNotFound(String),

    #[error("Image {0} not found in image vector")]
    ImageNotFound(String),

    #[error("Invalid Kubernetes version {0}")]
    InvalidKubernetesVersion(String),

    #[error("Shoot {0} has no technical ID yet")]
    MissingTechnicalId(String),

    #[error("PersistentVolume {0} was lost while renaming the Loki PVC; a new volume will be used")]
    VolumeLost(String),

    #[error("Cannot compute offset IP: {0}")]
    InvalidOffsetIp(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid quantity {0:?}")]
    InvalidQuantity(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::NotReady { .. } => "NotReady",
            Error::Timeout { .. } => "Timeout",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::ImageNotFound(_) => "ImageNotFound",
            Error::InvalidKubernetesVersion(_) => "InvalidKubernetesVersion",
            Error::MissingTechnicalId(_) => "MissingTechnicalId",
            Error::VolumeLost(_) => "VolumeLost",
            Error::InvalidOffsetIp(_) => "InvalidOffsetIp",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::InvalidQuantity(_) => "InvalidQuantity",
        }
    }
}

/// Whether an API error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(kube::error::ErrorResponse { code: 404, .. }))
}

pub mod botanist;
pub mod component;
pub mod config;
pub mod controllers;
pub mod health;
pub mod images;
pub mod migration;
pub mod utils;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use config::Config;
pub use controllers::State;
pub use metrics::Metrics;

/// Gardener and third-party CRDs
pub mod resources;

#[cfg(test)]
pub(crate) mod fixtures;

/// Field manager used for every server-side apply
pub const FIELD_MANAGER: &str = "gardenlet";
