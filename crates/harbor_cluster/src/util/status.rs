use chrono::{SecondsFormat, Utc};
use kube::api::{Api, Patch, PatchParams};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tracing::debug;
use std::fmt::Debug;

use crate::api::Condition;
use crate::util::errors::{Error, Result, StdError};

pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Sets the corresponding condition in conditions to new_condition and returns
/// a tuple containing the new conditions vector and whether it was changed.
///
/// 1. If the condition of the specified type already exists, all fields of the existing condition
///    are updated to new_condition. LastTransitionTime is set to now if the new status differs
///    from the old status; LastUpdateTime is set to now if any field changed. Re-asserting an
///    identical condition leaves it untouched.
/// 2. If a condition of the specified type does not exist, both timestamps are set to now()
///    and new_condition is appended
pub fn set_status_condition(
    conditions: &[Condition],
    mut new_condition: Condition,
) -> (Vec<Condition>, bool) {
    let mut new_conditions = Vec::from(conditions);
    let mut changed = false;
    let now = now();

    if let Some(index) = new_conditions.iter().position(|c| c.type_ == new_condition.type_) {
        let existing = &mut new_conditions[index];

        if existing.status != new_condition.status {
            existing.status = new_condition.status;
            existing.last_transition_time = Some(now.clone());
            changed = true;
        }

        if existing.reason != new_condition.reason {
            existing.reason = new_condition.reason;
            changed = true;
        }

        if existing.message != new_condition.message {
            existing.message = new_condition.message;
            changed = true;
        }

        if existing.observed_generation != new_condition.observed_generation {
            existing.observed_generation = new_condition.observed_generation;
            changed = true;
        }

        if changed {
            existing.last_update_time = Some(now);
        }
    } else {
        new_condition.last_transition_time = Some(now.clone());
        new_condition.last_update_time = Some(now);
        new_conditions.push(new_condition);
        changed = true;
    }

    (new_conditions, changed)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    is_status_condition_present_and_equal(conditions, condition_type, "True")
}

/// Returns true when condition_type is present and equal to status.
pub fn is_status_condition_present_and_equal(
    conditions: &[Condition],
    condition_type: &str,
    status: &str,
) -> bool {
    conditions
        .iter()
        .any(|condition| condition.type_ == condition_type && condition.status == status)
}

/// True when writing `status` over `previous` would change the stored object.
pub fn status_changed<S: Serialize>(previous: Option<&S>, status: &S) -> Result<bool> {
    let Some(previous) = previous else {
        return Ok(true);
    };
    Ok(serde_json::to_value(previous)? != serde_json::to_value(status)?)
}

/// Merge-patches the status subresource of `name` with `status`.
///
/// Nothing is sent when `status` equals `previous`, so a converged object
/// produces no watch event.
pub async fn patch_status<K, S>(api: &Api<K>, name: &str, previous: Option<&S>, status: &S) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
    S: Serialize,
{
    if !status_changed(previous, status)? {
        debug!("status of {} is unchanged", name);
        return Ok(());
    }
    let patch = Patch::Merge(json!({ "status": status }));
    api.patch_status(name, &PatchParams::default(), &patch)
        .await
        .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ComponentStatus;

    fn ready(status: bool, reason: &str) -> Condition {
        Condition::new("Ready", status, reason, "message")
    }

    #[test]
    fn test_set_status_condition_appends() {
        let (conditions, changed) = set_status_condition(&[], ready(true, "Testing"));
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].last_transition_time.is_some());
        assert_eq!(conditions[0].last_transition_time, conditions[0].last_update_time);
    }

    #[test]
    fn test_transition_moves_transition_time() {
        let (mut conditions, _) = set_status_condition(&[], ready(true, "Testing"));
        conditions[0].last_transition_time = Some("2020-01-01T00:00:00Z".to_string());

        let (conditions, changed) = set_status_condition(&conditions, ready(false, "Broken"));
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
        assert_ne!(conditions[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));
    }

    #[test]
    fn test_reassertion_leaves_condition_untouched() {
        let (mut conditions, _) = set_status_condition(&[], ready(true, "Testing"));
        conditions[0].last_transition_time = Some("2020-01-01T00:00:00Z".to_string());
        conditions[0].last_update_time = Some("2020-01-01T00:00:00Z".to_string());

        let (reasserted, changed) = set_status_condition(&conditions, ready(true, "Testing"));
        assert!(!changed);
        assert_eq!(reasserted, conditions);
    }

    #[test]
    fn test_message_change_touches_update_time_only() {
        let (mut conditions, _) = set_status_condition(&[], ready(true, "Testing"));
        conditions[0].last_transition_time = Some("2020-01-01T00:00:00Z".to_string());
        conditions[0].last_update_time = Some("2020-01-01T00:00:00Z".to_string());

        let (conditions, changed) =
            set_status_condition(&conditions, Condition::new("Ready", true, "Testing", "other"));
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_ne!(conditions[0].last_update_time.as_deref(), Some("2020-01-01T00:00:00Z"));
    }

    #[test]
    fn test_condition_lookups() {
        let (conditions, _) = set_status_condition(&[], ready(false, "Pending"));
        assert!(!is_status_condition_true(&conditions, "Ready"));
        assert!(is_status_condition_present_and_equal(&conditions, "Ready", "False"));
    }

    #[test]
    fn test_identical_status_is_not_rewritten() {
        let (conditions, _) = set_status_condition(&[], ready(true, "Testing"));
        let status = ComponentStatus {
            conditions,
            observed_generation: Some(2),
            reason: "Testing".to_string(),
            ..Default::default()
        };
        assert!(status_changed(None, &status).unwrap());

        let (again, _) = set_status_condition(&status.conditions, ready(true, "Testing"));
        let reasserted = ComponentStatus {
            conditions: again,
            ..status.clone()
        };
        assert!(!status_changed(Some(&status), &reasserted).unwrap());

        let bumped = ComponentStatus {
            observed_generation: Some(3),
            ..status.clone()
        };
        assert!(status_changed(Some(&status), &bumped).unwrap());
    }

    #[tokio::test]
    async fn test_converged_status_sends_no_patch() {
        use crate::api::v1alpha1::{Portal, PortalSpec};
        use crate::apply::tests::FakeApiServer;
        use kube::Resource;

        let server = FakeApiServer::default();
        let mut portal = Portal::new("harbor", PortalSpec::default());
        portal.metadata.namespace = Some("registry".to_string());
        let path = format!("{}/harbor", Portal::url_path(&(), Some("registry")));
        server.insert(&path, serde_json::to_value(&portal).unwrap());
        let api: Api<Portal> = Api::namespaced(server.client(), "registry");

        let (conditions, _) = set_status_condition(&[], ready(true, "Available"));
        let status = ComponentStatus {
            conditions,
            observed_generation: Some(1),
            ..Default::default()
        };
        patch_status(&api, "harbor", None, &status).await.unwrap();
        assert_eq!(server.writes().len(), 1);
        let stored: Portal = serde_json::from_value(server.get(&path).unwrap()).unwrap();
        let stored = stored.status.unwrap();

        let (reasserted, _) = set_status_condition(&stored.conditions, ready(true, "Available"));
        let again = ComponentStatus {
            conditions: reasserted,
            ..stored.clone()
        };
        assert_eq!(serde_json::to_vec(&again).unwrap(), serde_json::to_vec(&stored).unwrap());
        patch_status(&api, "harbor", Some(&stored), &again).await.unwrap();
        assert_eq!(server.writes().len(), 1);
    }
}
