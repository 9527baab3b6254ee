//! Helpers over `metav1.Condition` lists.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Find the condition with the given type.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or replace the condition with the same type. The transition time is
/// preserved when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if condition.last_transition_time.0.timestamp() == 0 {
        condition.last_transition_time = Time(Utc::now());
    }
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Whether the condition with the given type has status `True`.
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).map(|c| c.status == "True") == Some(true)
}

/// Build a condition with the transition time set to now.
pub fn new_condition(type_: &str, status: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_owned(),
        status: if status { "True" } else { "False" }.to_owned(),
        reason: reason.to_owned(),
        message: message.to_owned(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_by_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, new_condition("Ready", false, "PodPending", ""));
        set_condition(&mut conditions, new_condition("Migratable", true, "Migratable", ""));
        set_condition(&mut conditions, new_condition("Ready", true, "PodReady", ""));

        assert_eq!(conditions.len(), 2);
        assert!(is_condition_true(&conditions, "Ready"));
        assert!(is_condition_true(&conditions, "Migratable"));
    }

    #[test]
    fn set_preserves_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, new_condition("Ready", true, "PodReady", ""));
        let first = find_condition(&conditions, "Ready")
            .unwrap()
            .last_transition_time
            .clone();

        set_condition(&mut conditions, new_condition("Ready", true, "PodReady", "still fine"));
        let second = find_condition(&conditions, "Ready").unwrap();
        assert_eq!(second.last_transition_time, first);
        assert_eq!(second.message, "still fine");
    }

    #[test]
    fn missing_condition_is_not_true() {
        assert!(!is_condition_true(&[], "Ready"));
    }
}
