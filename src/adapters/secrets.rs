//! Pinning of dependent secrets via finalizers

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::info;

use crate::crd::Etcd;
use crate::error::is_not_found;
use crate::utils::retry_on_conflict;
use crate::{Error, Result};

/// Names of all secrets the Etcd pins: the TLS triple plus the store secret.
pub fn referenced_secrets(etcd: &Etcd) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(tls) = &etcd.spec.etcd.tls {
        names.push(tls.client_tls_secret_ref.name.clone());
        names.push(tls.server_tls_secret_ref.name.clone());
        names.push(tls.tls_ca_secret_ref.name.clone());
    }
    if let Some(secret_ref) = etcd.spec.backup.store.as_ref().and_then(|s| s.secret_ref.as_ref()) {
        names.push(secret_ref.name.clone());
    }
    names
}

/// Add the finalizer to every referenced secret. A missing secret is a hard
/// error: the spec references it, so the workload cannot run without it.
pub async fn add_finalizers(client: &Client, etcd: &Etcd, finalizer: &str) -> Result<()> {
    let namespace = etcd.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    for name in referenced_secrets(etcd) {
        retry_on_conflict(|| async {
            let secret = secrets.get(&name).await?;
            if secret.finalizers().iter().any(|f| f == finalizer) {
                return Ok(());
            }
            info!("Adding finalizer to secret {}/{}", namespace, name);
            let mut finalizers: Vec<String> = secret.finalizers().to_vec();
            finalizers.push(finalizer.to_string());
            patch_finalizers(&secrets, &name, finalizers).await
        })
        .await
        .map_err(|e| Error::SecretError(format!("cannot pin secret {}: {}", name, e)))?;
    }
    Ok(())
}

/// Remove the finalizer from every referenced secret that still carries it.
/// Secrets already gone are skipped.
pub async fn remove_finalizers(client: &Client, etcd: &Etcd, finalizer: &str) -> Result<()> {
    let namespace = etcd.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    for name in referenced_secrets(etcd) {
        let result = retry_on_conflict(|| async {
            let secret = match secrets.get(&name).await {
                Ok(secret) => secret,
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) => return Err(e),
            };
            if !secret.finalizers().iter().any(|f| f == finalizer) {
                return Ok(());
            }
            info!("Removing finalizer from secret {}/{}", namespace, name);
            let finalizers: Vec<String> = secret
                .finalizers()
                .iter()
                .filter(|f| f.as_str() != finalizer)
                .cloned()
                .collect();
            patch_finalizers(&secrets, &name, finalizers).await
        })
        .await;
        match result {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                return Err(Error::SecretError(format!(
                    "cannot release secret {}: {}",
                    name, e
                )))
            }
        }
    }
    Ok(())
}

async fn patch_finalizers(
    secrets: &Api<Secret>,
    name: &str,
    finalizers: Vec<String>,
) -> kube::Result<()> {
    let patch = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    secrets
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
