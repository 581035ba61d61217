use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::core::{Condition, LastOperation};

pub static SEED_FINALIZER: &str = "gardener";

/// Seed represents an installation request for an external controller.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Seed",
    group = "core.gardener.cloud",
    version = "v1beta1",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"SeedSystemComponentsHealthy\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "SeedStatus")]
#[serde(rename_all = "camelCase")]
pub struct SeedSpec {
    /// Settings contains certain settings for this seed cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<SeedSettings>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedSettings {
    /// DependencyWatchdog controls the dependency-watchdog settings for the seed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_watchdog: Option<SeedSettingDependencyWatchdog>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct SeedSettingDependencyWatchdog {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weeder: Option<EnabledSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prober: Option<EnabledSetting>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct EnabledSetting {
    pub enabled: bool,
}

/// SeedStatus is the status of a Seed.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    /// Kubernetes version of the seed cluster.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
}

impl Seed {
    /// The dependency-watchdog weeder is enabled unless explicitly disabled
    pub fn dependency_watchdog_weeder_enabled(&self) -> bool {
        self.dependency_watchdog()
            .and_then(|dwd| dwd.weeder.as_ref())
            .is_none_or(|weeder| weeder.enabled)
    }

    /// The dependency-watchdog prober is enabled unless explicitly disabled
    pub fn dependency_watchdog_prober_enabled(&self) -> bool {
        self.dependency_watchdog()
            .and_then(|dwd| dwd.prober.as_ref())
            .is_none_or(|prober| prober.enabled)
    }

    fn dependency_watchdog(&self) -> Option<&SeedSettingDependencyWatchdog> {
        self.spec
            .settings
            .as_ref()
            .and_then(|s| s.dependency_watchdog.as_ref())
    }

    pub fn last_operation(&self) -> Option<&LastOperation> {
        self.status.as_ref().and_then(|s| s.last_operation.as_ref())
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_watchdog_defaults_to_enabled() {
        let seed = Seed::new("local", SeedSpec::default());
        assert!(seed.dependency_watchdog_weeder_enabled());
        assert!(seed.dependency_watchdog_prober_enabled());
    }

    #[test]
    fn dependency_watchdog_can_be_disabled() {
        let seed = Seed::new(
            "local",
            SeedSpec {
                settings: Some(SeedSettings {
                    dependency_watchdog: Some(SeedSettingDependencyWatchdog {
                        weeder: Some(EnabledSetting { enabled: false }),
                        prober: None,
                    }),
                }),
            },
        );
        assert!(!seed.dependency_watchdog_weeder_enabled());
        assert!(seed.dependency_watchdog_prober_enabled());
    }
}
