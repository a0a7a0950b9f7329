//! Lease-based leader election
//!
//! Blocks until this instance holds the lock, then keeps renewing it in the
//! background. Only the elected instance runs the reconcilers; losing the
//! lease terminates the process so a restart rejoins the election.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{error, info, warn};

use crate::error::{is_conflict, is_not_found};
use crate::{Error, Result};

const LEASE_DURATION_SECONDS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Block until the named lease is held by this instance, then renew it in a
/// background task.
pub async fn acquire(client: Client, lease_name: String) -> Result<()> {
    let namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let identity = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| format!("etcd-druid-operator-{}", std::process::id()));
    let leases: Api<Lease> = Api::namespaced(client, &namespace);

    info!(
        "Waiting for leader lease {}/{} as {}",
        namespace, lease_name, identity
    );

    loop {
        match try_acquire(&leases, &lease_name, &identity).await {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => warn!("Leader election attempt failed: {}", e),
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }

    info!("Acquired leader lease {}/{}", namespace, lease_name);

    tokio::spawn(renew_loop(leases, lease_name, identity));
    Ok(())
}

async fn try_acquire(leases: &Api<Lease>, name: &str, identity: &str) -> Result<bool> {
    let now = MicroTime(Utc::now());
    let existing = match leases.get(name).await {
        Ok(lease) => lease,
        Err(e) if is_not_found(&e) => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                    acquire_time: Some(now.clone()),
                    renew_time: Some(now),
                    lease_transitions: Some(0),
                }),
            };
            return match leases.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(e) if is_conflict(&e) => Ok(false),
                Err(e) => Err(Error::from(e)),
            };
        }
        Err(e) => return Err(Error::from(e)),
    };

    let spec = existing.spec.clone().unwrap_or_default();
    let held_by_us = spec.holder_identity.as_deref() == Some(identity);
    let expired = spec
        .renew_time
        .as_ref()
        .map(|t| {
            let age = Utc::now().signed_duration_since(t.0);
            age.num_seconds() > spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64
        })
        .unwrap_or(true);

    if !held_by_us && !expired {
        return Ok(false);
    }

    let transitions = spec.lease_transitions.unwrap_or(0) + if held_by_us { 0 } else { 1 };
    let now = MicroTime(Utc::now());
    let patch = json!({
        "spec": {
            "holderIdentity": identity,
            "leaseDurationSeconds": LEASE_DURATION_SECONDS,
            "acquireTime": if held_by_us { spec.acquire_time.clone().unwrap_or_else(|| now.clone()) } else { now.clone() },
            "renewTime": now,
            "leaseTransitions": transitions,
        }
    });
    match leases
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(e) if is_conflict(&e) => Ok(false),
        Err(e) => Err(Error::from(e)),
    }
}

async fn renew_loop(leases: Api<Lease>, name: String, identity: String) {
    loop {
        tokio::time::sleep(RENEW_INTERVAL).await;
        match try_acquire(&leases, &name, &identity).await {
            Ok(true) => {}
            Ok(false) => {
                error!("Lost leader lease {}, terminating", name);
                std::process::exit(1);
            }
            Err(e) => warn!("Leader lease renewal failed: {}", e),
        }
    }
}
