//! Claiming, adoption, and release of child objects

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{info, warn};

use crate::crd::{Etcd, OWNED_BY_ANNOTATION, OWNER_TYPE, OWNER_TYPE_ANNOTATION};
use crate::error::is_precondition_violated;
use crate::utils::{retry_on_conflict, selector_matches, selector_string};
use crate::{Error, Result};

/// What to do with a candidate child.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClaimAction {
    /// Child already carries our controller reference
    Claim,
    /// Child is controlled by someone else
    Skip,
    /// Child is unowned and selected; stamp ownership
    Adopt,
    /// We appear in the owner references but the child is no longer selected
    Release,
    /// Nothing to do
    NoOp,
}

/// Outcome of a claim pass.
#[derive(Debug)]
pub struct ClaimResult<K> {
    /// Children owned by the parent after the pass
    pub claimed: Vec<K>,
    /// Children whose stale owner reference was stripped
    pub released: Vec<K>,
}

/// Decide what to do with a candidate child, given its owner references and
/// labels. Pure; the adoption branch is still subject to the late
/// `can_adopt` re-check.
pub fn claim_action(
    etcd: &Etcd,
    owner_references: &[OwnerReference],
    labels: &BTreeMap<String, String>,
) -> ClaimAction {
    let parent_uid = etcd.metadata.uid.as_deref().unwrap_or_default();

    if let Some(controller) = owner_references.iter().find(|r| r.controller == Some(true)) {
        if controller.uid == parent_uid {
            return ClaimAction::Claim;
        }
        return ClaimAction::Skip;
    }

    if selector_matches(&etcd.spec.selector, labels)
        && etcd.metadata.deletion_timestamp.is_none()
    {
        return ClaimAction::Adopt;
    }

    if owner_references.iter().any(|r| r.uid == parent_uid) {
        return ClaimAction::Release;
    }
    ClaimAction::NoOp
}

/// Adoption and release manager for the children of one Etcd.
pub struct RefManager<'a> {
    client: Client,
    etcd: &'a Etcd,
}

impl<'a> RefManager<'a> {
    pub fn new(client: Client, etcd: &'a Etcd) -> Self {
        Self { client, etcd }
    }

    /// Run the claim pass over pre-listed candidates. Adoption performs the
    /// late parent re-check before the first mutation; per-child errors are
    /// collected so the remaining children are still processed.
    pub async fn claim<K>(&self, api: &Api<K>, children: Vec<K>) -> Result<ClaimResult<K>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let mut result = ClaimResult {
            claimed: Vec::new(),
            released: Vec::new(),
        };
        let mut errors: Vec<String> = Vec::new();
        let mut adoption_allowed: Option<bool> = None;

        for child in children {
            match claim_action(self.etcd, child.owner_references(), child.labels()) {
                ClaimAction::Claim => result.claimed.push(child),
                ClaimAction::Skip | ClaimAction::NoOp => {}
                ClaimAction::Adopt => {
                    // Re-check deletion with an uncached read after listing
                    // but before mutating anything.
                    let allowed = match adoption_allowed {
                        Some(allowed) => allowed,
                        None => {
                            let allowed = match self.can_adopt().await {
                                Ok(()) => true,
                                Err(e) => {
                                    errors.push(e.to_string());
                                    false
                                }
                            };
                            adoption_allowed = Some(allowed);
                            allowed
                        }
                    };
                    if !allowed {
                        continue;
                    }
                    match self.adopt(api, &child).await {
                        Ok(Some(adopted)) => result.claimed.push(adopted),
                        Ok(None) => result.claimed.push(child),
                        Err(e) => errors.push(e.to_string()),
                    }
                }
                ClaimAction::Release => match self.release(api, &child).await {
                    Ok(()) => result.released.push(child),
                    Err(e) => errors.push(e.to_string()),
                },
            }
        }

        if !errors.is_empty() {
            return Err(Error::OwnershipError(errors.join("; ")));
        }
        Ok(result)
    }

    /// List the StatefulSets selected by the parent.
    pub async fn fetch_statefulsets(&self) -> Result<Vec<StatefulSet>> {
        let namespace = self.etcd.namespace().unwrap_or_default();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        let lp = ListParams::default().labels(&selector_string(&self.etcd.spec.selector)?);
        Ok(api.list(&lp).await.map_err(Error::from)?.items)
    }

    /// Uncached read of the parent, asserting it is still the same object and
    /// not marked for deletion.
    async fn can_adopt(&self) -> Result<()> {
        let namespace = self.etcd.namespace().unwrap_or_default();
        let name = self.etcd.name_any();
        let api: Api<Etcd> = Api::namespaced(self.client.clone(), &namespace);
        let found = api.get(&name).await.map_err(Error::from)?;

        if found.metadata.deletion_timestamp.is_some() {
            return Err(Error::OwnershipError(format!(
                "{}/{} etcd is marked for deletion",
                namespace, name
            )));
        }
        if found.metadata.uid != self.etcd.metadata.uid {
            return Err(Error::OwnershipError(format!(
                "original {}/{} etcd gone: got uid {:?}, wanted {:?}",
                namespace, name, found.metadata.uid, self.etcd.metadata.uid
            )));
        }
        Ok(())
    }

    async fn adopt<K>(&self, api: &Api<K>, child: &K) -> Result<Option<K>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let name = child.name_any();
        info!(
            "Adopting {} {}/{}",
            K::kind(&()),
            child.namespace().unwrap_or_default(),
            name
        );

        let mut owner_references = child.owner_references().to_vec();
        owner_references.push(self.etcd.owner_reference());
        let patch = json!({
            "metadata": {
                "ownerReferences": owner_references,
                "annotations": {
                    OWNED_BY_ANNOTATION: self.etcd.owned_by_value(),
                    OWNER_TYPE_ANNOTATION: OWNER_TYPE,
                }
            }
        });

        match retry_on_conflict(|| async {
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
        })
        .await
        {
            Ok(adopted) => Ok(Some(adopted)),
            Err(e) if is_precondition_violated(&e) => {
                warn!("Adoption precondition doesn't hold for {}, skipping", name);
                Ok(None)
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn release<K>(&self, api: &Api<K>, child: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        let name = child.name_any();
        let parent_uid = self.etcd.metadata.uid.as_deref().unwrap_or_default();
        info!(
            "Releasing {} {}/{}",
            K::kind(&()),
            child.namespace().unwrap_or_default(),
            name
        );

        let remaining: Vec<OwnerReference> = child
            .owner_references()
            .iter()
            .filter(|r| r.uid != parent_uid)
            .cloned()
            .collect();
        let patch = json!({
            "metadata": {
                "ownerReferences": remaining,
            }
        });

        match retry_on_conflict(|| async {
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
        })
        .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_precondition_violated(&e) => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}
