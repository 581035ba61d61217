//! Health checks of workloads and ManagedResources, folded into [`Condition`]s.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::ResourceExt;

use crate::component::managedresources;
use crate::resources::core::{Condition, LastOperation};
use crate::resources::managedresources::ManagedResource;
use crate::{Error, Result};

pub mod conditions;
pub mod seed;

pub use conditions::{
    failed_condition, get_or_init_condition, merge_conditions, new_condition_or_error,
    updated_condition, ConditionThresholds,
};

fn not_ready(message: String, reason: &str) -> Error {
    Error::NotReady {
        message,
        reason: reason.into(),
        requeue_after: None,
    }
}

fn check_observed_generation(
    kind: &str,
    name: &str,
    generation: Option<i64>,
    observed_generation: Option<i64>,
) -> Result<()> {
    let generation = generation.unwrap_or_default();
    let observed = observed_generation.unwrap_or_default();
    if observed < generation {
        return Err(not_ready(
            format!("observed generation of {kind} {name} outdated ({observed}/{generation})"),
            "OutdatedGeneration",
        ));
    }
    Ok(())
}

/// Checks whether the StatefulSet is rolled out and has all its replicas ready
pub fn check_stateful_set(sts: &StatefulSet) -> Result<()> {
    check_observed_generation(
        "statefulset",
        &sts.name_any(),
        sts.metadata.generation,
        sts.status.as_ref().and_then(|s| s.observed_generation),
    )?;

    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or_default();
    if ready < replicas {
        return Err(not_ready(
            format!("not enough ready replicas ({ready}/{replicas})"),
            "ReplicasNotReady",
        ));
    }
    Ok(())
}

/// Checks whether the Deployment is rolled out and available
pub fn check_deployment(deployment: &Deployment) -> Result<()> {
    let status = deployment.status.as_ref();
    check_observed_generation(
        "deployment",
        &deployment.name_any(),
        deployment.metadata.generation,
        status.and_then(|s| s.observed_generation),
    )?;

    let condition = |r#type: &str| {
        status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.type_ == r#type))
    };

    match condition("Available") {
        None => {
            return Err(not_ready(
                "condition \"Available\" is missing".into(),
                "DeploymentUnavailable",
            ))
        }
        Some(c) if c.status != "True" => {
            return Err(not_ready(
                format!(
                    "condition \"Available\" has invalid status {} (expected True) due to {}: {}",
                    c.status,
                    c.reason.as_deref().unwrap_or_default(),
                    c.message.as_deref().unwrap_or_default()
                ),
                "DeploymentUnavailable",
            ))
        }
        Some(_) => {}
    }

    if let Some(c) = condition("Progressing") {
        if c.status == "False" {
            return Err(not_ready(
                format!(
                    "condition \"Progressing\" has invalid status False due to {}: {}",
                    c.reason.as_deref().unwrap_or_default(),
                    c.message.as_deref().unwrap_or_default()
                ),
                "DeploymentNotProgressing",
            ));
        }
    }
    Ok(())
}

/// Turns object checks into transitions of a condition.
///
/// Each `check_*` returns `None` when everything is healthy and the failed condition otherwise.
pub struct HealthChecker {
    now: DateTime<Utc>,
    thresholds: ConditionThresholds,
    last_operation: Option<LastOperation>,
}

impl HealthChecker {
    pub fn new(
        now: DateTime<Utc>,
        thresholds: ConditionThresholds,
        last_operation: Option<LastOperation>,
    ) -> Self {
        Self {
            now,
            thresholds,
            last_operation,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn failed(&self, condition: &Condition, reason: &str, message: &str) -> Condition {
        failed_condition(
            self.now,
            self.last_operation.as_ref(),
            &self.thresholds,
            condition,
            reason,
            message,
        )
    }

    fn fail_on(&self, condition: &Condition, result: Result<()>, reason: &str) -> Option<Condition> {
        match result {
            Ok(()) => None,
            Err(Error::NotReady {
                message,
                reason: not_ready_reason,
                ..
            }) => {
                let reason = if reason.is_empty() {
                    not_ready_reason.as_str()
                } else {
                    reason
                };
                Some(self.failed(condition, reason, &message))
            }
            Err(err) => Some(self.failed(condition, reason, &err.to_string())),
        }
    }

    pub fn check_managed_resource(
        &self,
        condition: &Condition,
        mr: &ManagedResource,
    ) -> Option<Condition> {
        self.fail_on(condition, managedresources::check_managed_resource(mr), "")
    }

    pub fn check_stateful_sets(
        &self,
        condition: &Condition,
        stateful_sets: &[StatefulSet],
    ) -> Option<Condition> {
        stateful_sets.iter().find_map(|sts| {
            self.fail_on(condition, check_stateful_set(sts), "StatefulSetUnhealthy")
        })
    }

    pub fn check_deployments(
        &self,
        condition: &Condition,
        deployments: &[Deployment],
    ) -> Option<Condition> {
        deployments.iter().find_map(|deployment| {
            self.fail_on(condition, check_deployment(deployment), "DeploymentUnhealthy")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::managedresources::ManagedResourceSpec;
    use chrono::TimeZone;
    use k8s_openapi::api::apps::v1::{DeploymentStatus, StatefulSetSpec, StatefulSetStatus};
    use serde_json::json;

    fn checker() -> HealthChecker {
        HealthChecker::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ConditionThresholds::new(),
            None,
        )
    }

    fn healthy_condition() -> Condition {
        Condition {
            r#type: "SeedSystemComponentsHealthy".into(),
            status: "True".into(),
            ..Default::default()
        }
    }

    fn stateful_set(replicas: i32, ready: i32) -> StatefulSet {
        StatefulSet {
            metadata: kube::api::ObjectMeta {
                name: Some("prometheus".into()),
                generation: Some(2),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(2),
                ready_replicas: Some(ready),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn stateful_set_needs_ready_replicas() {
        assert!(check_stateful_set(&stateful_set(2, 2)).is_ok());
        let err = check_stateful_set(&stateful_set(2, 1)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Component is not yet Ready: not enough ready replicas (1/2)"
        );
    }

    #[test]
    fn stateful_set_with_outdated_generation_is_unhealthy() {
        let mut sts = stateful_set(1, 1);
        sts.metadata.generation = Some(3);
        assert!(check_stateful_set(&sts).is_err());
    }

    #[test]
    fn deployment_needs_available_condition() {
        let deployment = |conditions: serde_json::Value| Deployment {
            status: Some(DeploymentStatus {
                conditions: Some(serde_json::from_value(conditions).unwrap()),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(check_deployment(&deployment(json!([]))).is_err());
        assert!(check_deployment(&deployment(json!([
            {"type": "Available", "status": "True"},
            {"type": "Progressing", "status": "True"}
        ])))
        .is_ok());
        assert!(check_deployment(&deployment(json!([
            {"type": "Available", "status": "True"},
            {"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}
        ])))
        .is_err());

        let condition = checker()
            .check_deployments(&healthy_condition(), &[deployment(json!([]))])
            .unwrap();
        assert_eq!(condition.reason.as_deref(), Some("DeploymentUnhealthy"));
        assert!(!condition.message.unwrap().starts_with("Component is not yet Ready"));
    }

    #[test]
    fn checker_reports_unhealthy_stateful_set() {
        let condition = checker()
            .check_stateful_sets(&healthy_condition(), &[stateful_set(1, 1), stateful_set(1, 0)])
            .unwrap();
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason.as_deref(), Some("StatefulSetUnhealthy"));
        assert_eq!(
            condition.message.as_deref(),
            Some("not enough ready replicas (0/1)")
        );

        assert!(checker()
            .check_stateful_sets(&healthy_condition(), &[stateful_set(1, 1)])
            .is_none());
    }

    #[test]
    fn checker_uses_managed_resource_condition_reason() {
        let mut mr = ManagedResource::new("vpa", ManagedResourceSpec::default());
        mr.status = serde_json::from_value(json!({
            "observedGeneration": 0,
            "conditions": [
                {"type": "ResourcesApplied", "status": "True"},
                {"type": "ResourcesHealthy", "status": "False", "reason": "PodsCrashing", "message": "oops"}
            ]
        }))
        .unwrap();

        let condition = checker()
            .check_managed_resource(&healthy_condition(), &mr)
            .unwrap();
        assert_eq!(condition.status, "False");
        assert_eq!(condition.reason.as_deref(), Some("PodsCrashing"));
    }
}
