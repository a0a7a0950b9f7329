//! Readiness predicate for the managed workload

use k8s_openapi::api::apps::v1::StatefulSet;

use crate::crd::Etcd;

/// Check whether the workload converged to the spec and is serving.
/// Returns the first failed condition as the unreadiness reason.
pub fn check_statefulset(etcd: &Etcd, sts: &StatefulSet) -> Result<(), String> {
    let desired = sts
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(etcd.spec.replicas.min(1));
    let status = match &sts.status {
        Some(status) => status,
        None => return Err("statefulset has no status".to_string()),
    };

    if sts.metadata.generation != status.observed_generation {
        return Err(format!(
            "observed generation {:?} is outdated against generation {:?}",
            status.observed_generation, sts.metadata.generation
        ));
    }

    let updated = status.updated_replicas.unwrap_or(0);
    if updated < desired {
        return Err(format!(
            "rolling update in progress, {} of {} replicas updated",
            updated, desired
        ));
    }

    let ready = status.ready_replicas.unwrap_or(0);
    if ready < desired {
        return Err(format!("{} of {} replicas ready", ready, desired));
    }

    let current = status.current_replicas.unwrap_or(0);
    if current < desired {
        return Err(format!("{} of {} replicas current", current, desired));
    }

    Ok(())
}

/// Convenience wrapper over [`check_statefulset`].
pub fn is_ready(etcd: &Etcd, sts: &StatefulSet) -> bool {
    check_statefulset(etcd, sts).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BackupSpec, EtcdConfig, EtcdSpec, LabelSelector};
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn etcd() -> Etcd {
        Etcd::new(
            "foo",
            EtcdSpec {
                selector: LabelSelector::default(),
                labels: Default::default(),
                annotations: Default::default(),
                replicas: 1,
                etcd: EtcdConfig::default(),
                backup: BackupSpec::default(),
                shared_config: None,
                volume_claim_template: None,
                storage_class: None,
                storage_capacity: None,
                priority_class_name: None,
            },
        )
    }

    fn statefulset(generation: i64, observed: i64, ready: i32, updated: i32) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(observed),
                ready_replicas: Some(ready),
                current_replicas: Some(ready),
                updated_replicas: Some(updated),
                replicas: 1,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn converged_statefulset_is_ready() {
        assert!(check_statefulset(&etcd(), &statefulset(2, 2, 1, 1)).is_ok());
    }

    #[test]
    fn outdated_observed_generation_is_not_ready() {
        let err = check_statefulset(&etcd(), &statefulset(3, 2, 1, 1)).unwrap_err();
        assert!(err.contains("observed generation"));
    }

    #[test]
    fn partial_rollout_is_not_ready() {
        let err = check_statefulset(&etcd(), &statefulset(2, 2, 1, 0)).unwrap_err();
        assert!(err.contains("rolling update"));
    }

    #[test]
    fn unready_replicas_are_reported() {
        let err = check_statefulset(&etcd(), &statefulset(2, 2, 0, 1)).unwrap_err();
        assert!(err.contains("0 of 1 replicas ready"));
    }

    #[test]
    fn missing_status_is_not_ready() {
        let mut sts = statefulset(1, 1, 1, 1);
        sts.status = None;
        assert!(check_statefulset(&etcd(), &sts).is_err());
    }
}
