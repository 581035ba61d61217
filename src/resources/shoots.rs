use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::core::{Condition, LastOperation};

pub static SHOOT_FINALIZER: &str = "gardener";

/// Purpose of shoots that get neither monitoring nor control plane logging
pub const PURPOSE_TESTING: &str = "testing";

/// Shoot represents a managed Kubernetes cluster whose control plane runs in a seed.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Shoot",
    group = "core.gardener.cloud",
    version = "v1beta1",
    namespaced,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.kubernetes.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "ShootStatus")]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Purpose is the purpose class for this cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub kubernetes: ShootKubernetes,
    /// SeedName is the name of the seed cluster that runs the control plane of the Shoot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_name: Option<String>,
    #[serde(default)]
    pub provider: ShootProvider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hibernation: Option<Hibernation>,
    /// ControlPlane contains general settings for the control plane of the shoot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlane>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ShootKubernetes {
    pub version: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ShootProvider {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<Worker>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct Worker {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct Hibernation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlane {
    /// HighAvailability holds the configuration settings for high availability of the control plane.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_availability: Option<serde_json::Value>,
}

/// ShootStatus holds the most recently observed status of the Shoot cluster.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    /// TechnicalID is the name that is used for creating the Seed namespace.
    #[serde(rename = "technicalID", skip_serializing_if = "Option::is_none")]
    pub technical_id: Option<String>,
}

impl Shoot {
    pub fn is_workerless(&self) -> bool {
        self.spec.provider.workers.is_empty()
    }

    pub fn is_hibernated(&self) -> bool {
        self.spec
            .hibernation
            .as_ref()
            .and_then(|h| h.enabled)
            .unwrap_or(false)
    }

    /// The namespace hosting this shoot's control plane in the seed
    pub fn seed_namespace(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.technical_id.as_deref())
    }

    pub fn purpose(&self) -> &str {
        self.spec.purpose.as_deref().unwrap_or("evaluation")
    }

    /// Replica count for control plane components: zero while hibernated
    pub fn get_replicas(&self, wokenup: i32) -> i32 {
        if self.is_hibernated() {
            0
        } else {
            wokenup
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shoot_without_workers_is_workerless() {
        let shoot = Shoot::new("foo", ShootSpec::default());
        assert!(shoot.is_workerless());
        assert_eq!(shoot.purpose(), "evaluation");
    }

    #[test]
    fn hibernated_shoot_has_no_replicas() {
        let mut shoot = Shoot::new("foo", ShootSpec::default());
        assert_eq!(shoot.get_replicas(2), 2);
        shoot.spec.hibernation = Some(Hibernation {
            enabled: Some(true),
        });
        assert_eq!(shoot.get_replicas(2), 0);
    }

    #[test]
    fn technical_id_is_read_from_status() {
        let shoot: Shoot = serde_json::from_value(serde_json::json!({
            "apiVersion": "core.gardener.cloud/v1beta1",
            "kind": "Shoot",
            "metadata": {"name": "foo", "namespace": "garden-dev"},
            "spec": {"kubernetes": {"version": "1.29.1"}, "provider": {"workers": [{"name": "pool"}]}},
            "status": {"technicalID": "shoot--dev--foo"}
        }))
        .unwrap();
        assert_eq!(shoot.seed_namespace(), Some("shoot--dev--foo"));
        assert!(!shoot.is_workerless());
    }
}
