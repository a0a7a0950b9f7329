//! Controller for Etcd resources

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{
    runtime::{
        controller::{self, Action, Controller},
        finalizer::{finalizer, Event},
        watcher,
    },
    Api, ResourceExt,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::controllers::Context;
use crate::crd::{Etcd, OPERATION_ANNOTATION};
use crate::metrics::prometheus::{RECONCILE_DURATION, RECONCILIATIONS, RECONCILIATION_ERRORS};
use crate::reconcilers::etcd as etcd_reconciler;
use crate::Error;

/// Finalizer guarding the Etcd and its pinned secrets
pub const FINALIZER: &str = "druid.gardener.cloud/etcd-druid";

/// Run the etcd controller
pub async fn run(ctx: Arc<Context>, workers: usize) {
    let client = ctx.client.clone();
    let etcds: Api<Etcd> = Api::all(client.clone());

    info!("Starting Etcd controller with {} workers", workers);

    let mut builder = Controller::new(etcds, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(workers as u16));
    if ctx.ignore_operation_annotation {
        builder = builder
            .owns(
                Api::<Service>::all(client.clone()),
                watcher::Config::default(),
            )
            .owns(
                Api::<ConfigMap>::all(client.clone()),
                watcher::Config::default(),
            )
            .owns(
                Api::<StatefulSet>::all(client.clone()),
                watcher::Config::default(),
            );
    }

    builder
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Reconciled {:?}", o),
                Err(e) => error!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    info!("Etcd controller stopped");
}

/// Reconcile an Etcd resource
#[instrument(skip(etcd, ctx), fields(name = %etcd.name_any(), namespace = etcd.namespace().unwrap_or_default()))]
async fn reconcile(etcd: Arc<Etcd>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start = std::time::Instant::now();
    let ns = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();

    RECONCILIATIONS.with_label_values(&["Etcd"]).inc();

    // The operation annotation is the manual trigger; without it the
    // reconcile path is suspended. The delete path always runs.
    if !ctx.ignore_operation_annotation
        && etcd.metadata.deletion_timestamp.is_none()
        && !etcd.annotations().contains_key(OPERATION_ANNOTATION)
    {
        return Ok(Action::await_change());
    }

    let etcds: Api<Etcd> = Api::namespaced(ctx.client.clone(), &ns);

    let result = finalizer(&etcds, FINALIZER, etcd, |event| async {
        match event {
            Event::Apply(etcd) => apply(&etcd, &ctx).await,
            Event::Cleanup(etcd) => cleanup(&etcd, &ctx).await,
        }
    })
    .await;

    let duration = start.elapsed().as_secs_f64();
    RECONCILE_DURATION
        .with_label_values(&["Etcd"])
        .observe(duration);

    match &result {
        Ok(_) => info!("Successfully reconciled {}/{} in {:.2}s", ns, name, duration),
        Err(e) => {
            RECONCILIATION_ERRORS.with_label_values(&["Etcd"]).inc();
            error!("Failed to reconcile {}/{}: {:?}", ns, name, e);
        }
    }

    Ok(result?)
}

/// Reconcile path: pin secrets, advertise the transition, sync children,
/// wait for readiness, write the final status.
async fn apply(etcd: &Etcd, ctx: &Context) -> Result<Action, Error> {
    let client = &ctx.client;
    let ns = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();

    info!("Reconciling Etcd {}/{}", ns, name);

    if let Err(e) = etcd_reconciler::pin_dependent_secrets(client, etcd, FINALIZER).await {
        record_error(client, etcd, None, &e).await;
        return Err(e);
    }

    etcd_reconciler::update_status_as_not_ready(client, etcd).await?;

    let (service, statefulset) =
        match etcd_reconciler::reconcile_children(client, &ctx.image_vector, etcd).await {
            Ok(children) => children,
            Err(e) => {
                record_error(client, etcd, None, &e).await;
                return Err(e);
            }
        };

    let statefulset =
        match etcd_reconciler::wait_until_statefulset_ready(client, etcd, &statefulset).await {
            Ok(sts) => sts,
            Err(e) => {
                record_error(client, etcd, Some(&statefulset), &e).await;
                return Err(e);
            }
        };

    etcd_reconciler::update_status(client, etcd, &service, &statefulset).await?;

    Ok(Action::await_change())
}

/// Delete path: remove owned workloads, release pinned secrets. The
/// finalizer helper drops the parent finalizer last, via patch.
async fn cleanup(etcd: &Etcd, ctx: &Context) -> Result<Action, Error> {
    let client = &ctx.client;
    let ns = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();

    info!("Deleting Etcd {}/{}", ns, name);

    if let Err(e) = etcd_reconciler::delete_statefulsets(client, etcd).await {
        record_error(client, etcd, None, &e).await;
        return Err(e);
    }

    if let Err(e) = etcd_reconciler::release_dependent_secrets(client, etcd, FINALIZER).await {
        record_error(client, etcd, None, &e).await;
        return Err(e);
    }

    info!("Deleted Etcd {}/{} successfully", ns, name);
    Ok(Action::await_change())
}

async fn record_error(
    client: &kube::Client,
    etcd: &Etcd,
    sts: Option<&StatefulSet>,
    err: &Error,
) {
    if let Err(status_err) =
        etcd_reconciler::update_error_status(client, etcd, sts, err).await
    {
        error!(
            "Error while updating error status for {}/{}: {}",
            etcd.namespace().unwrap_or_default(),
            etcd.name_any(),
            status_err
        );
    }
}

/// Error policy for the controller
fn error_policy(etcd: Arc<Etcd>, err: &Error, _ctx: Arc<Context>) -> Action {
    let ns = etcd.namespace().unwrap_or_default();
    let name = etcd.name_any();

    error!("Reconciliation error for {}/{}: {:?}", ns, name, err);

    match err {
        Error::KubeError(_) | Error::NotReady(_) => Action::requeue(Duration::from_secs(30)),
        Error::ValidationError(_) | Error::RenderError(_) | Error::ImageError(_) => {
            Action::requeue(Duration::from_secs(300))
        }
        _ => Action::requeue(Duration::from_secs(60)),
    }
}
