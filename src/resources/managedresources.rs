use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::core::Condition;

pub const CONDITION_RESOURCES_APPLIED: &str = "ResourcesApplied";
pub const CONDITION_RESOURCES_HEALTHY: &str = "ResourcesHealthy";
pub const CONDITION_RESOURCES_PROGRESSING: &str = "ResourcesProgressing";

/// ManagedResource describes a list of managed resources, applied by the resource-manager.
/// API: resources.gardener.cloud/v1alpha1
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "resources.gardener.cloud",
    version = "v1alpha1",
    kind = "ManagedResource",
    shortname = "mr",
    namespaced
)]
#[kube(status = "ManagedResourceStatus")]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceSpec {
    /// Secrets holding the manifests
    #[serde(default)]
    pub secret_refs: Vec<LocalObjectReference>,

    /// Resource class handled by the resource-manager; `seed` applies into the seed itself
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    /// Labels injected into all managed objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inject_labels: Option<BTreeMap<String, String>>,

    /// Don't delete the objects in the target when the ManagedResource is deleted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_objects: Option<bool>,

    /// Overwrite labels of existing objects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_overwrite_labels: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ManagedResource {
    pub fn condition(&self, r#type: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == r#type))
    }
}
