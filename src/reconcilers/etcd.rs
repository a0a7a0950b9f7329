//! Reconciliation logic for Etcd resources: child sync, readiness wait,
//! status custody, and the delete path

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Event, PersistentVolumeClaim, Pod, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::adapters::images::ImageVector;
use crate::adapters::values::{self, Values};
use crate::adapters::{chart, secrets};
use crate::crd::{
    CrossVersionObjectReference, Etcd, OPERATION_ANNOTATION, OWNED_BY_ANNOTATION,
    OWNER_TYPE_ANNOTATION,
};
use crate::error::{is_not_found, is_precondition_violated};
use crate::reconcilers::health;
use crate::reconcilers::ref_manager::RefManager;
use crate::utils::{
    is_pod_in_crashloop_backoff, k8s_selector_string, retry_on_conflict, selector_string,
};
use crate::{Error, Result};

/// Poll interval of the readiness wait
pub const READINESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Overall budget of the readiness wait
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Sync all children in dependency order. Returns the live service and
/// workload; the caller runs the readiness wait separately so it can still
/// reflect the workload into an error status on timeout.
pub async fn reconcile_children(
    client: &Client,
    images: &ImageVector,
    etcd: &Etcd,
) -> Result<(Service, StatefulSet)> {
    let mut values = values::assemble(etcd, images)?;
    let rendered = chart::render(&values)?;

    let service = sync_service(client, etcd, &rendered).await?;
    values.service_name = service.name_any();

    let config_map = sync_config_map(client, etcd, &rendered).await?;
    values.config_map_name = config_map.name_any();

    let statefulset = sync_statefulset(client, etcd, &values).await?;
    Ok((service, statefulset))
}

/// Sync the client service: list, claim, deduplicate, converge the spec.
pub async fn sync_service(
    client: &Client,
    etcd: &Etcd,
    rendered: &chart::RenderedChart,
) -> Result<Service> {
    let namespace = etcd.namespace().unwrap_or_default();
    let api: Api<Service> = Api::namespaced(client.clone(), &namespace);

    let claimed = list_and_claim(client, etcd, &api).await?;
    if let Some(live) = keep_first(&api, claimed).await? {
        let desired = rendered.service()?;
        if live.spec == desired.spec {
            return Ok(live);
        }

        let mut updated = live.clone();
        let mut desired_spec = desired.spec.clone().unwrap_or_default();
        // ClusterIP is immutable; carry the live value forward.
        desired_spec.cluster_ip = live.spec.as_ref().and_then(|s| s.cluster_ip.clone());
        desired_spec.cluster_ips = live.spec.as_ref().and_then(|s| s.cluster_ips.clone());
        updated.spec = Some(desired_spec);

        return patch_child(&api, &live.name_any(), &updated, "Service").await;
    }

    let desired = rendered.service()?;
    create_child(&api, &desired, "Service").await
}

/// Sync the bootstrap config map: list, claim, deduplicate, converge the data.
pub async fn sync_config_map(
    client: &Client,
    etcd: &Etcd,
    rendered: &chart::RenderedChart,
) -> Result<ConfigMap> {
    let namespace = etcd.namespace().unwrap_or_default();
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);

    let claimed = list_and_claim(client, etcd, &api).await?;
    if let Some(live) = keep_first(&api, claimed).await? {
        let desired = rendered.config_map()?;
        if live.data == desired.data {
            return Ok(live);
        }

        let mut updated = live.clone();
        updated.data = desired.data.clone();
        return patch_child(&api, &live.name_any(), &updated, "ConfigMap").await;
    }

    let desired = rendered.config_map()?;
    create_child(&api, &desired, "ConfigMap").await
}

/// Sync the workload: list, claim, deduplicate, converge the spec with
/// immutable fields preserved, swap on selector change, drain crash-looping
/// pods.
pub async fn sync_statefulset(
    client: &Client,
    etcd: &Etcd,
    values: &Values,
) -> Result<StatefulSet> {
    let namespace = etcd.namespace().unwrap_or_default();
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);

    let claimed = list_and_claim(client, etcd, &api).await?;
    if let Some(live) = keep_first(&api, claimed).await? {
        let synced = sync_statefulset_spec(&api, &live, values).await?;
        drain_crashlooping_pods(client, &namespace, &synced).await;
        return Ok(synced);
    }

    let desired = chart::render_statefulset(values)?;
    create_child(&api, &desired, "StatefulSet").await
}

async fn sync_statefulset_spec(
    api: &Api<StatefulSet>,
    live: &StatefulSet,
    values: &Values,
) -> Result<StatefulSet> {
    let mut desired = chart::render_statefulset(values)?;
    if live.spec == desired.spec {
        return Ok(live.clone());
    }

    let live_spec = live.spec.clone().unwrap_or_default();
    let desired_spec = desired.spec.as_mut().ok_or_else(|| {
        Error::RenderError("rendered statefulset has no spec".to_string())
    })?;

    // Container resources may have been adjusted by an external autoscaler;
    // carry the live values into the desired pod template.
    if let Some(template_spec) = desired_spec.template.spec.as_mut() {
        let live_containers = live_spec
            .template
            .spec
            .as_ref()
            .map(|s| s.containers.clone())
            .unwrap_or_default();
        for container in template_spec.containers.iter_mut() {
            let live_container = live_containers
                .iter()
                .find(|c| c.name == container.name)
                .ok_or_else(|| {
                    Error::KubeError(format!(
                        "container {} not found in statefulset {}",
                        container.name,
                        live.name_any()
                    ))
                })?;
            container.resources = live_container.resources.clone();
        }
    }

    if live_spec.selector != desired_spec.selector {
        // The platform forbids selector mutation; swap the object.
        info!(
            "Selector changed, recreating statefulset {}",
            live.name_any()
        );
        return recreate_statefulset(api, &desired).await;
    }

    let mut updated = live.clone();
    let mut updated_spec = live_spec;
    updated_spec.replicas = desired_spec.replicas;
    updated_spec.update_strategy = desired_spec.update_strategy.clone();
    updated_spec.template = desired_spec.template.clone();
    updated.spec = Some(updated_spec);

    patch_child(api, &live.name_any(), &updated, "StatefulSet").await
}

/// Delete-then-create swap with a single conflict-retry loop; the delete is
/// not re-issued once it has succeeded.
async fn recreate_statefulset(
    api: &Api<StatefulSet>,
    desired: &StatefulSet,
) -> Result<StatefulSet> {
    let name = desired.name_any();
    let skip_delete = AtomicBool::new(false);

    let created = retry_on_conflict(|| {
        let api = api.clone();
        let name = name.clone();
        let desired = desired.clone();
        let skip_delete = &skip_delete;
        async move {
            if !skip_delete.load(Ordering::SeqCst) {
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => return Err(e),
                }
                skip_delete.store(true, Ordering::SeqCst);
            }
            api.create(&PostParams::default(), &desired).await
        }
    })
    .await;

    match created {
        Ok(sts) => Ok(sts),
        Err(e) if is_precondition_violated(&e) => {
            info!(
                "StatefulSet {} precondition doesn't hold, skip updating it",
                name
            );
            Ok(desired.clone())
        }
        Err(e) => Err(Error::from(e)),
    }
}

/// Best-effort restart of pods stuck in CrashLoopBackOff under the workload's
/// selector.
async fn drain_crashlooping_pods(client: &Client, namespace: &str, sts: &StatefulSet) {
    let selector = match sts.spec.as_ref().map(|s| &s.selector) {
        Some(selector) => selector,
        None => return,
    };
    let selector = match k8s_selector_string(selector) {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot build pod selector for drain: {}", e);
            return;
        }
    };

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = match pods.list(&ListParams::default().labels(&selector)).await {
        Ok(list) => list,
        Err(e) => {
            warn!("Cannot list pods for drain: {}", e);
            return;
        }
    };

    for pod in list.items {
        let crashlooping = pod
            .status
            .as_ref()
            .map(is_pod_in_crashloop_backoff)
            .unwrap_or(false);
        if crashlooping {
            let name = pod.name_any();
            info!("Deleting pod {}/{} in crashloop backoff", namespace, name);
            if let Err(e) = pods.delete(&name, &DeleteParams::default()).await {
                if !is_not_found(&e) {
                    warn!("Error deleting crashlooping pod {}: {}", name, e);
                }
            }
        }
    }
}

/// Poll the workload until it passes the readiness checks, re-reading it at
/// each tick. On timeout, warning events from unbound claims of the
/// workload's volume claim templates are attached to the error.
pub async fn wait_until_statefulset_ready(
    client: &Client,
    etcd: &Etcd,
    sts: &StatefulSet,
) -> Result<StatefulSet> {
    let namespace = etcd.namespace().unwrap_or_default();
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
    let name = sts.name_any();

    let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
    let mut last_reason = String::new();
    let mut latest = sts.clone();

    loop {
        match api.get(&name).await {
            Ok(current) => {
                match health::check_statefulset(etcd, &current) {
                    Ok(()) => return Ok(current),
                    Err(reason) => last_reason = reason,
                }
                latest = current;
            }
            Err(e) if is_not_found(&e) => last_reason = e.to_string(),
            Err(e) => return Err(Error::from(e)),
        }

        if tokio::time::Instant::now() + READINESS_CHECK_INTERVAL > deadline {
            break;
        }
        tokio::time::sleep(READINESS_CHECK_INTERVAL).await;
    }

    let mut message = format!(
        "statefulset {}/{} not ready within {:?}: {}",
        namespace, name, READINESS_TIMEOUT, last_reason
    );
    // Fetching events is best effort and must not mask the real error.
    match fetch_pvc_events(client, &namespace, &latest).await {
        Ok(events) if !events.is_empty() => {
            message.push_str("\n\n");
            message.push_str(&events);
        }
        Ok(_) => {}
        Err(e) => warn!("Error while fetching events for depending PVC: {}", e),
    }
    Err(Error::NotReady(message))
}

async fn fetch_pvc_events(
    client: &Client,
    namespace: &str,
    sts: &StatefulSet,
) -> Result<String> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let events: Api<Event> = Api::namespaced(client.clone(), namespace);
    let list = pvcs.list(&ListParams::default()).await.map_err(Error::from)?;

    let templates = sts
        .spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_ref())
        .cloned()
        .unwrap_or_default();

    let mut messages = String::new();
    for template in &templates {
        let prefix = format!("{}-{}", template.name_any(), sts.name_any());
        for pvc in &list.items {
            let bound = pvc
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                == Some("Bound");
            if bound || !pvc.name_any().starts_with(&prefix) {
                continue;
            }

            let fields = format!(
                "involvedObject.name={},involvedObject.namespace={},type=Warning",
                pvc.name_any(),
                namespace
            );
            let warnings = events
                .list(&ListParams::default().fields(&fields))
                .await
                .map_err(Error::from)?;
            let mut texts: Vec<String> = warnings
                .items
                .iter()
                .filter_map(|ev| ev.message.clone())
                .collect();
            texts.dedup();
            if !texts.is_empty() {
                messages.push_str(&format!(
                    "Warning for PVC {}:\n{}\n",
                    pvc.name_any(),
                    texts.join("\n")
                ));
            }
        }
    }
    Ok(messages)
}

/// Whether the workload may be deleted during the parent's delete path:
/// it must carry the parent's UID in its owner references or the matching
/// annotation pair.
pub fn can_delete_statefulset(sts: &StatefulSet, etcd: &Etcd) -> bool {
    let parent_uid = etcd.metadata.uid.as_deref().unwrap_or_default();
    if sts
        .owner_references()
        .iter()
        .any(|r| !parent_uid.is_empty() && r.uid == parent_uid)
    {
        return true;
    }
    let annotations = sts.annotations();
    annotations.get(OWNED_BY_ANNOTATION) == Some(&etcd.owned_by_value())
        && annotations.get(OWNER_TYPE_ANNOTATION).map(String::as_str)
            == Some(crate::crd::OWNER_TYPE)
}

/// Delete path step (a): remove the workloads selected by the parent, but
/// only those passing the ownership check.
pub async fn delete_statefulsets(client: &Client, etcd: &Etcd) -> Result<()> {
    let namespace = etcd.namespace().unwrap_or_default();
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
    let lp = ListParams::default().labels(&selector_string(&etcd.spec.selector)?);
    let list = api.list(&lp).await.map_err(Error::from)?;

    for sts in list.items {
        if !can_delete_statefulset(&sts, etcd) {
            continue;
        }
        let name = sts.name_any();
        info!("Deleting statefulset {}/{}", namespace, name);
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(())
}

/// Kind of a status write. Only terminal writes acknowledge the operation
/// annotation; the transition write at the start of a reconcile must leave
/// the manual trigger in place until the pass reaches an end state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StatusWrite {
    /// Mid-reconcile write advertising work in progress
    Transition,
    /// End-of-reconcile write, success or recorded error
    Terminal,
}

impl StatusWrite {
    /// Whether this write removes the operation annotation afterwards.
    pub fn acknowledges_operation(self) -> bool {
        matches!(self, StatusWrite::Terminal)
    }
}

/// Final status write after a successful reconcile.
pub async fn update_status(
    client: &Client,
    etcd: &Etcd,
    service: &Service,
    sts: &StatefulSet,
) -> Result<()> {
    let (patch, write) = final_status(etcd, service, sts);
    write_status(client, etcd, patch, write).await
}

/// Error status write: record the message, stamp the time, update the
/// observed generation, and reflect readiness when the workload is known.
pub async fn update_error_status(
    client: &Client,
    etcd: &Etcd,
    sts: Option<&StatefulSet>,
    error: &Error,
) -> Result<()> {
    let (patch, write) = error_status(etcd, sts, error);
    write_status(client, etcd, patch, write).await
}

/// Advertise a transition: readiness unknown, no replicas confirmed.
pub async fn update_status_as_not_ready(client: &Client, etcd: &Etcd) -> Result<()> {
    let (patch, write) = not_ready_status();
    write_status(client, etcd, patch, write).await
}

fn final_status(
    etcd: &Etcd,
    service: &Service,
    sts: &StatefulSet,
) -> (serde_json::Value, StatusWrite) {
    let ready = health::is_ready(etcd, sts);
    let patch = json!({
        "status": {
            "ready": ready,
            "serviceName": service.name_any(),
            "lastError": null,
            "lastErrorTime": null,
            "observedGeneration": etcd.metadata.generation,
            "etcd": CrossVersionObjectReference {
                api_version: "apps/v1".to_string(),
                kind: "StatefulSet".to_string(),
                name: sts.name_any(),
            },
        }
    });
    (patch, StatusWrite::Terminal)
}

fn error_status(
    etcd: &Etcd,
    sts: Option<&StatefulSet>,
    error: &Error,
) -> (serde_json::Value, StatusWrite) {
    let mut status = json!({
        "lastError": error.to_string(),
        "lastErrorTime": Utc::now(),
        "observedGeneration": etcd.metadata.generation,
    });
    if let Some(sts) = sts {
        status["ready"] = json!(health::is_ready(etcd, sts));
    }
    (json!({ "status": status }), StatusWrite::Terminal)
}

fn not_ready_status() -> (serde_json::Value, StatusWrite) {
    let patch = json!({
        "status": {
            "ready": null,
            "readyReplicas": 0,
        }
    });
    (patch, StatusWrite::Transition)
}

async fn write_status(
    client: &Client,
    etcd: &Etcd,
    patch: serde_json::Value,
    write: StatusWrite,
) -> Result<()> {
    let namespace = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();
    let api: Api<Etcd> = Api::namespaced(client.clone(), &namespace);

    retry_on_conflict(|| async {
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
    })
    .await
    .map_err(Error::from)?;

    if write.acknowledges_operation() {
        return remove_operation_annotation(client, etcd).await;
    }
    Ok(())
}

/// Acknowledge a manual trigger by dropping the operation annotation.
pub async fn remove_operation_annotation(client: &Client, etcd: &Etcd) -> Result<()> {
    if !etcd.annotations().contains_key(OPERATION_ANNOTATION) {
        return Ok(());
    }
    let namespace = etcd.namespace().unwrap_or_default();
    let api: Api<Etcd> = Api::namespaced(client.clone(), &namespace);
    let patch = json!({
        "metadata": {
            "annotations": {
                OPERATION_ANNOTATION: null,
            }
        }
    });
    match api
        .patch(&etcd.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}

/// Pin every referenced secret while the parent lives.
pub async fn pin_dependent_secrets(client: &Client, etcd: &Etcd, finalizer: &str) -> Result<()> {
    secrets::add_finalizers(client, etcd, finalizer).await
}

/// Release the pinned secrets during the delete path.
pub async fn release_dependent_secrets(
    client: &Client,
    etcd: &Etcd,
    finalizer: &str,
) -> Result<()> {
    secrets::remove_finalizers(client, etcd, finalizer).await
}

async fn list_and_claim<K>(client: &Client, etcd: &Etcd, api: &Api<K>) -> Result<Vec<K>>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    let lp = ListParams::default().labels(&selector_string(&etcd.spec.selector)?);
    let children = api.list(&lp).await.map_err(Error::from)?.items;
    let manager = RefManager::new(client.clone(), etcd);
    Ok(manager.claim(api, children).await?.claimed)
}

/// Keep exactly one claimed child: delete the surplus best-effort and refetch
/// the survivor.
async fn keep_first<K>(api: &Api<K>, claimed: Vec<K>) -> Result<Option<K>>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    let mut iter = claimed.into_iter();
    let first = match iter.next() {
        Some(first) => first,
        None => return Ok(None),
    };

    for surplus in iter {
        let name = surplus.name_any();
        info!("Found duplicate {}, deleting it: {}", K::kind(&()), name);
        if let Err(e) = api.delete(&name, &DeleteParams::default()).await {
            warn!("Error deleting duplicate {} {}: {}", K::kind(&()), name, e);
        }
    }

    let live = api.get(&first.name_any()).await.map_err(Error::from)?;
    Ok(Some(live))
}

async fn patch_child<K>(api: &Api<K>, name: &str, updated: &K, kind: &str) -> Result<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    match retry_on_conflict(|| async {
        api.patch(name, &PatchParams::default(), &Patch::Merge(updated))
            .await
    })
    .await
    {
        Ok(patched) => Ok(patched),
        Err(e) if is_precondition_violated(&e) => {
            info!("{} {} precondition doesn't hold, skip updating it", kind, name);
            Ok(updated.clone())
        }
        Err(e) => Err(Error::from(e)),
    }
}

async fn create_child<K>(api: &Api<K>, desired: &K, kind: &str) -> Result<K>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::Serialize
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    match api.create(&PostParams::default(), desired).await {
        Ok(created) => Ok(created),
        Err(e) if is_precondition_violated(&e) => {
            info!(
                "{} {} precondition doesn't hold, skip updating it",
                kind,
                desired.name_any()
            );
            Ok(desired.clone())
        }
        Err(e) => Err(Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BackupSpec, EtcdConfig, EtcdSpec, LabelSelector};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn etcd() -> Etcd {
        let mut etcd = Etcd::new(
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
        );
        etcd.metadata.namespace = Some("shoot--dev--foo".to_string());
        etcd.metadata.generation = Some(2);
        etcd
    }

    fn service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("foo-client".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn statefulset() -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn not_ready_write_is_a_transition_and_keeps_the_operation_annotation() {
        let (patch, write) = not_ready_status();
        assert_eq!(write, StatusWrite::Transition);
        assert!(!write.acknowledges_operation());

        let status = patch["status"].as_object().unwrap();
        assert!(status.contains_key("ready") && status["ready"].is_null());
        assert_eq!(status["readyReplicas"], 0);
    }

    #[test]
    fn final_write_is_terminal_and_acknowledges_the_operation() {
        let (patch, write) = final_status(&etcd(), &service(), &statefulset());
        assert_eq!(write, StatusWrite::Terminal);
        assert!(write.acknowledges_operation());

        let status = patch["status"].as_object().unwrap();
        assert!(status.contains_key("lastError") && status["lastError"].is_null());
        assert!(status.contains_key("lastErrorTime") && status["lastErrorTime"].is_null());
        assert_eq!(status["serviceName"], "foo-client");
        assert_eq!(status["observedGeneration"], 2);
    }

    #[test]
    fn error_write_is_terminal_and_records_the_message() {
        let error = Error::NotReady("0 of 1 replicas ready".to_string());
        let (patch, write) = error_status(&etcd(), None, &error);
        assert_eq!(write, StatusWrite::Terminal);
        assert!(write.acknowledges_operation());

        let status = patch["status"].as_object().unwrap();
        assert!(status["lastError"]
            .as_str()
            .unwrap()
            .contains("0 of 1 replicas ready"));
        assert!(status["lastErrorTime"].is_string());
        assert!(!status.contains_key("ready"));
    }

    #[test]
    fn error_write_reflects_readiness_only_when_the_workload_is_known() {
        let error = Error::NotReady("timeout".to_string());
        let (patch, _) = error_status(&etcd(), Some(&statefulset()), &error);
        let status = patch["status"].as_object().unwrap();
        assert_eq!(status["ready"], false);
    }
}
