//! Custodian controller: projects workload status onto the Etcd status

use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Api, ResourceExt,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::controllers::Context;
use crate::crd::{
    self, Condition, CrossVersionObjectReference, Etcd, OWNED_BY_ANNOTATION,
};
use crate::metrics::prometheus::{READY_REPLICAS, RECONCILIATIONS, RECONCILIATION_ERRORS};
use crate::reconcilers::health;
use crate::reconcilers::ref_manager::RefManager;
use crate::utils::retry_on_conflict;
use crate::{Error, Result};

/// How long a freshly recorded `lastError` suppresses the custodian, so it
/// does not overwrite the reconciler's error report.
const LAST_ERROR_SKIP_WINDOW: i64 = 300;

/// Run the custodian controller
pub async fn run(ctx: Arc<Context>, workers: usize) {
    let client = ctx.client.clone();
    let etcds: Api<Etcd> = Api::all(client.clone());
    let statefulsets: Api<StatefulSet> = Api::all(client.clone());

    info!("Starting Etcd custodian controller with {} workers", workers);

    Controller::new(etcds, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(workers as u16))
        .watches(
            statefulsets,
            watcher::Config::default(),
            map_statefulset_to_etcd,
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Custodian reconciled {:?}", o),
                Err(e) => error!("Custodian reconcile failed: {:?}", e),
            }
        })
        .await;

    info!("Etcd custodian controller stopped");
}

/// Map a StatefulSet event to its owning Etcd, via the controller owner
/// reference or the owned-by annotation.
fn map_statefulset_to_etcd(sts: StatefulSet) -> Option<ObjectRef<Etcd>> {
    let namespace = sts.namespace()?;
    if let Some(owner) = sts
        .owner_references()
        .iter()
        .find(|r| r.kind == crd::KIND && r.api_version.starts_with(crd::API_GROUP))
    {
        return Some(ObjectRef::new(&owner.name).within(&namespace));
    }
    let owned_by = sts.annotations().get(OWNED_BY_ANNOTATION)?;
    let (owner_ns, owner_name) = owned_by.split_once('/')?;
    Some(ObjectRef::new(owner_name).within(owner_ns))
}

/// Project workload counts and readiness onto the parent status. The
/// custodian never mutates child objects.
#[instrument(skip(etcd, ctx), fields(name = %etcd.name_any(), namespace = etcd.namespace().unwrap_or_default()))]
async fn reconcile(etcd: Arc<Etcd>, ctx: Arc<Context>) -> Result<Action> {
    let ns = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();

    RECONCILIATIONS.with_label_values(&["EtcdCustodian"]).inc();

    // Leave a freshly written reconcile error in place; only a stale one may
    // be overwritten, so a dead reconciler cannot mask recovery forever.
    if let Some(status) = &etcd.status {
        let has_error = status.last_error.as_deref().is_some_and(|e| !e.is_empty());
        let fresh = status
            .last_error_time
            .map(|t| Utc::now().signed_duration_since(t) < ChronoDuration::seconds(LAST_ERROR_SKIP_WINDOW))
            .unwrap_or(true);
        if has_error && fresh {
            info!(
                "Requeueing {}/{} because of last error: {:?}",
                ns, name, status.last_error
            );
            return Ok(Action::requeue(Duration::from_secs(30)));
        }
    }

    let manager = RefManager::new(ctx.client.clone(), &etcd);
    let statefulsets = manager.fetch_statefulsets().await?;

    // With zero or several workloads the etcd controller has to decide;
    // report the degraded view and check back shortly.
    if statefulsets.len() != 1 {
        update_status_without_statefulset(&ctx.client, &etcd).await?;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    update_status_with_statefulset(&ctx.client, &etcd, &statefulsets[0]).await?;
    Ok(Action::await_change())
}

async fn update_status_with_statefulset(
    client: &kube::Client,
    etcd: &Etcd,
    sts: &StatefulSet,
) -> Result<()> {
    let ready = health::is_ready(etcd, sts);
    let (current, ready_replicas, updated) = sts
        .status
        .as_ref()
        .map(|s| {
            (
                s.current_replicas.unwrap_or(0),
                s.ready_replicas.unwrap_or(0),
                s.updated_replicas.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0, 0));

    let mut conditions = etcd
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_ready_condition(
        &mut conditions,
        ready,
        if ready { "Ready" } else { "NotReady" },
        &format!("{} of {} replicas ready", ready_replicas, etcd.spec.replicas),
    );

    let namespace = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();
    READY_REPLICAS
        .with_label_values(&[namespace.as_str(), name.as_str()])
        .set(ready_replicas as f64);

    let patch = json!({
        "status": {
            "etcd": CrossVersionObjectReference {
                api_version: "apps/v1".to_string(),
                kind: "StatefulSet".to_string(),
                name: sts.name_any(),
            },
            "currentReplicas": current,
            "readyReplicas": ready_replicas,
            "updatedReplicas": updated,
            "ready": ready,
            "conditions": conditions,
        }
    });
    write_status(client, etcd, patch).await
}

async fn update_status_without_statefulset(client: &kube::Client, etcd: &Etcd) -> Result<()> {
    info!(
        "Updating etcd status of {}/{} with no statefulset found",
        etcd.namespace().unwrap_or_default(),
        etcd.name_any()
    );

    // Conditions maintained by other actors are preserved; only the Ready
    // condition owned by this controller is rewritten.
    let mut conditions = etcd
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    set_ready_condition(&mut conditions, false, "NoStatefulSet", "no statefulset found");

    let patch = json!({
        "status": {
            "currentReplicas": 0,
            "readyReplicas": 0,
            "updatedReplicas": 0,
            "ready": false,
            "conditions": conditions,
        }
    });
    write_status(client, etcd, patch).await
}

async fn write_status(client: &kube::Client, etcd: &Etcd, patch: serde_json::Value) -> Result<()> {
    let namespace = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();
    let api: Api<Etcd> = Api::namespaced(client.clone(), &namespace);

    retry_on_conflict(|| async {
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
    })
    .await
    .map_err(Error::from)?;
    Ok(())
}

/// Update the Ready condition in place, keeping every other condition and
/// refreshing the transition time only when the status flips.
pub fn set_ready_condition(
    conditions: &mut Vec<Condition>,
    ready: bool,
    reason: &str,
    message: &str,
) {
    let status = if ready { "True" } else { "False" };
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == "Ready") {
        if existing.status != status {
            existing.last_transition_time = Utc::now();
        }
        existing.status = status.to_string();
        existing.reason = Some(reason.to_string());
        existing.message = Some(message.to_string());
    } else {
        conditions.push(Condition {
            type_: "Ready".to_string(),
            status: status.to_string(),
            last_transition_time: Utc::now(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        });
    }
}

/// Error policy for the custodian
fn error_policy(etcd: Arc<Etcd>, err: &Error, _ctx: Arc<Context>) -> Action {
    RECONCILIATION_ERRORS
        .with_label_values(&["EtcdCustodian"])
        .inc();
    error!(
        "Custodian error for {}/{}: {:?}",
        etcd.namespace().unwrap_or_default(),
        etcd.name_any(),
        err
    );
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_condition_is_added_when_absent() {
        let mut conditions = Vec::new();
        set_ready_condition(&mut conditions, true, "Ready", "1 of 1 replicas ready");
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "Ready");
        assert_eq!(conditions[0].status, "True");
    }

    #[test]
    fn foreign_conditions_survive_an_update() {
        let mut conditions = vec![Condition {
            type_: "BackupReady".to_string(),
            status: "True".to_string(),
            last_transition_time: Utc::now(),
            reason: None,
            message: None,
        }];
        set_ready_condition(&mut conditions, false, "NoStatefulSet", "no statefulset found");
        assert_eq!(conditions.len(), 2);
        assert!(conditions.iter().any(|c| c.type_ == "BackupReady"));
    }

    #[test]
    fn transition_time_changes_only_on_status_flip() {
        let mut conditions = Vec::new();
        set_ready_condition(&mut conditions, true, "Ready", "ok");
        let first = conditions[0].last_transition_time;
        set_ready_condition(&mut conditions, true, "Ready", "still ok");
        assert_eq!(conditions[0].last_transition_time, first);
        set_ready_condition(&mut conditions, false, "NotReady", "gone");
        assert_ne!(conditions[0].last_transition_time, first);
    }
}
