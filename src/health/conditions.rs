use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::resources::core::{
    Condition, LastOperation, CONDITION_FALSE, CONDITION_INITIALIZED, CONDITION_PROGRESSING,
    CONDITION_TRUE, CONDITION_UNKNOWN, LAST_OPERATION_STATE_SUCCEEDED,
};
use crate::Result;

/// Reason set when a condition could not be computed
pub const CONDITION_CHECK_ERROR: &str = "ConditionCheckError";

/// Per condition type, how long a failing check may stay `Progressing` before it turns `False`
pub type ConditionThresholds = BTreeMap<String, Duration>;

/// The condition of type `r#type` from `conditions`, or a new `Unknown` one
pub fn get_or_init_condition(
    conditions: &[Condition],
    r#type: &str,
    now: DateTime<Utc>,
) -> Condition {
    if let Some(condition) = conditions.iter().find(|c| c.r#type == r#type) {
        return condition.clone();
    }
    Condition {
        r#type: r#type.into(),
        status: CONDITION_UNKNOWN.into(),
        last_transition_time: Some(Time(now)),
        last_update_time: Some(Time(now)),
        reason: Some(CONDITION_INITIALIZED.into()),
        message: Some(
            "The condition has been initialized but its semantic check has not been performed yet."
                .into(),
        ),
        codes: Vec::new(),
    }
}

/// Returns `condition` with the given status, reason and message.
///
/// `lastTransitionTime` only moves when the status changes; `lastUpdateTime` moves whenever
/// anything changes.
pub fn updated_condition(
    condition: &Condition,
    status: &str,
    reason: &str,
    message: &str,
    codes: Vec<String>,
    now: DateTime<Utc>,
) -> Condition {
    let mut updated = condition.clone();
    let status_changed = condition.status != status;

    updated.status = status.into();
    updated.reason = Some(reason.into());
    updated.message = Some(message.into());
    updated.codes = codes;

    if status_changed || updated.last_transition_time.is_none() {
        updated.last_transition_time = Some(Time(now));
    }
    if updated != *condition || updated.last_update_time.is_none() {
        updated.last_update_time = Some(Time(now));
    }
    updated
}

fn elapsed_since(time: Option<&Time>, now: DateTime<Utc>) -> Duration {
    time.and_then(|t| (now - t.0).to_std().ok())
        .unwrap_or_default()
}

/// Transition `condition` after a failed check.
///
/// Without a threshold for the condition type it becomes `False` right away. With one, a `True`
/// condition first turns `Progressing`, and a `Progressing` condition turns `False` once it has
/// been in that state for longer than the threshold. A last operation that succeeded within the
/// threshold keeps it `Progressing`.
pub fn failed_condition(
    now: DateTime<Utc>,
    last_operation: Option<&LastOperation>,
    thresholds: &ConditionThresholds,
    condition: &Condition,
    reason: &str,
    message: &str,
) -> Condition {
    let threshold = thresholds.get(&condition.r#type);
    let status = match (condition.status.as_str(), threshold) {
        (CONDITION_TRUE, Some(_)) => CONDITION_PROGRESSING,
        (CONDITION_PROGRESSING, Some(threshold)) => {
            let recently_succeeded = last_operation.is_some_and(|op| {
                op.state == LAST_OPERATION_STATE_SUCCEEDED
                    && elapsed_since(op.last_update_time.as_ref(), now) <= *threshold
            });
            if recently_succeeded
                || elapsed_since(condition.last_transition_time.as_ref(), now) <= *threshold
            {
                CONDITION_PROGRESSING
            } else {
                CONDITION_FALSE
            }
        }
        _ => CONDITION_FALSE,
    };
    updated_condition(condition, status, reason, message, Vec::new(), now)
}

/// The outcome of a check, or `old` marked `Unknown` when the check itself failed
pub fn new_condition_or_error(
    now: DateTime<Utc>,
    old: &Condition,
    new: Result<Condition>,
) -> Condition {
    match new {
        Ok(condition) => condition,
        Err(err) => updated_condition(
            old,
            CONDITION_UNKNOWN,
            CONDITION_CHECK_ERROR,
            &err.to_string(),
            Vec::new(),
            now,
        ),
    }
}

/// `existing` with every condition of `updated` replacing the one of the same type, new types
/// appended
pub fn merge_conditions(existing: &[Condition], updated: Vec<Condition>) -> Vec<Condition> {
    let mut merged = existing.to_vec();
    for condition in updated {
        match merged.iter_mut().find(|c| c.r#type == condition.r#type) {
            Some(old) => *old = condition,
            None => merged.push(condition),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use chrono::TimeZone;

    const TYPE: &str = "SeedSystemComponentsHealthy";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn condition(status: &str, transitioned: i64) -> Condition {
        Condition {
            r#type: TYPE.into(),
            status: status.into(),
            last_transition_time: Some(Time(at(transitioned))),
            last_update_time: Some(Time(at(transitioned))),
            reason: Some("Foo".into()),
            message: Some("foo".into()),
            codes: vec![],
        }
    }

    fn thresholds() -> ConditionThresholds {
        BTreeMap::from([(TYPE.to_string(), Duration::from_secs(60))])
    }

    #[test]
    fn init_condition_when_missing() {
        let c = get_or_init_condition(&[], TYPE, at(0));
        assert_eq!(c.status, "Unknown");
        assert_eq!(c.reason.as_deref(), Some("ConditionInitialized"));
        assert_eq!(c.last_transition_time, Some(Time(at(0))));

        let existing = condition("True", 0);
        let c = get_or_init_condition(std::slice::from_ref(&existing), TYPE, at(10));
        assert_eq!(c, existing);
    }

    #[test]
    fn update_keeps_transition_time_for_same_status() {
        let c = updated_condition(&condition("True", 0), "True", "Bar", "bar", vec![], at(30));
        assert_eq!(c.last_transition_time, Some(Time(at(0))));
        assert_eq!(c.last_update_time, Some(Time(at(30))));
        assert_eq!(c.reason.as_deref(), Some("Bar"));

        let c = updated_condition(&condition("True", 0), "False", "Bar", "bar", vec![], at(30));
        assert_eq!(c.last_transition_time, Some(Time(at(30))));
    }

    #[test]
    fn update_without_changes_keeps_update_time() {
        let c = updated_condition(&condition("True", 0), "True", "Foo", "foo", vec![], at(30));
        assert_eq!(c.last_update_time, Some(Time(at(0))));
    }

    #[test]
    fn failed_without_threshold_is_false() {
        let c = failed_condition(
            at(0),
            None,
            &BTreeMap::new(),
            &condition("True", 0),
            "Broken",
            "it broke",
        );
        assert_eq!(c.status, "False");
        assert_eq!(c.reason.as_deref(), Some("Broken"));
    }

    #[test]
    fn failed_with_threshold_progresses_first() {
        let c = failed_condition(at(5), None, &thresholds(), &condition("True", 0), "Broken", "");
        assert_eq!(c.status, "Progressing");
        assert_eq!(c.last_transition_time, Some(Time(at(5))));
    }

    #[test]
    fn progressing_turns_false_after_threshold() {
        let within = failed_condition(
            at(59),
            None,
            &thresholds(),
            &condition("Progressing", 0),
            "Broken",
            "",
        );
        assert_eq!(within.status, "Progressing");

        let after = failed_condition(
            at(61),
            None,
            &thresholds(),
            &condition("Progressing", 0),
            "Broken",
            "",
        );
        assert_eq!(after.status, "False");
    }

    #[test]
    fn recent_successful_operation_keeps_progressing() {
        let op = LastOperation {
            r#type: "Reconcile".into(),
            state: "Succeeded".into(),
            last_update_time: Some(Time(at(100))),
            progress: Some(100),
            description: None,
        };
        let c = failed_condition(
            at(130),
            Some(&op),
            &thresholds(),
            &condition("Progressing", 0),
            "Broken",
            "",
        );
        assert_eq!(c.status, "Progressing");

        let c = failed_condition(
            at(200),
            Some(&op),
            &thresholds(),
            &condition("Progressing", 0),
            "Broken",
            "",
        );
        assert_eq!(c.status, "False");
    }

    #[test]
    fn failed_from_false_or_unknown_is_false() {
        for status in ["False", "Unknown"] {
            let c = failed_condition(at(5), None, &thresholds(), &condition(status, 0), "B", "");
            assert_eq!(c.status, "False");
        }
    }

    #[test]
    fn errors_turn_condition_unknown() {
        let old = condition("True", 0);
        let c = new_condition_or_error(at(10), &old, Err(Error::InvalidConfig("boom".into())));
        assert_eq!(c.status, "Unknown");
        assert_eq!(c.reason.as_deref(), Some("ConditionCheckError"));
        assert_eq!(c.message.as_deref(), Some("Invalid configuration: boom"));

        let new = condition("False", 10);
        assert_eq!(new_condition_or_error(at(10), &old, Ok(new.clone())), new);
    }

    #[test]
    fn merge_replaces_by_type() {
        let existing = vec![condition("True", 0), {
            let mut other = condition("False", 0);
            other.r#type = "Other".into();
            other
        }];
        let mut extra = condition("True", 5);
        extra.r#type = "Extra".into();

        let merged = merge_conditions(&existing, vec![condition("Progressing", 5), extra]);
        let summary: Vec<(&str, &str)> = merged
            .iter()
            .map(|c| (c.r#type.as_str(), c.status.as_str()))
            .collect();
        assert_eq!(
            summary,
            [(TYPE, "Progressing"), ("Other", "False"), ("Extra", "True")]
        );
    }
}
