//! Tests for claim decisions and the delete-path ownership rule

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

use etcd_druid_operator::crd::{
    BackupSpec, Etcd, EtcdConfig, EtcdSpec, LabelSelector, OWNED_BY_ANNOTATION,
    OWNER_TYPE_ANNOTATION,
};
use etcd_druid_operator::reconcilers::etcd::can_delete_statefulset;
use etcd_druid_operator::reconcilers::ref_manager::{claim_action, ClaimAction};

// ============================================================================
// Test Helpers
// ============================================================================

const UID: &str = "a1b2c3d4-0000-4000-8000-000000000001";
const OTHER_UID: &str = "ffffffff-0000-4000-8000-00000000beef";

fn matching_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("role".to_string(), "etcd".to_string()),
        ("instance".to_string(), "foo".to_string()),
    ])
}

fn parent() -> Etcd {
    let mut etcd = Etcd::new(
        "foo",
        EtcdSpec {
            selector: LabelSelector {
                match_labels: matching_labels(),
                match_expressions: vec![],
            },
            labels: matching_labels(),
            annotations: BTreeMap::new(),
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
    etcd.metadata.uid = Some(UID.to_string());
    etcd
}

fn controller_ref(uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "druid.gardener.cloud/v1alpha1".to_string(),
        kind: "Etcd".to_string(),
        name: "foo".to_string(),
        uid: uid.to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

// ============================================================================
// Claim decisions
// ============================================================================

#[test]
fn child_with_our_controller_ref_is_claimed() {
    let action = claim_action(&parent(), &[controller_ref(UID)], &matching_labels());
    assert_eq!(action, ClaimAction::Claim);
}

#[test]
fn child_controlled_by_someone_else_is_skipped() {
    let action = claim_action(&parent(), &[controller_ref(OTHER_UID)], &matching_labels());
    assert_eq!(action, ClaimAction::Skip);
}

#[test]
fn unowned_selected_child_is_adopted() {
    let action = claim_action(&parent(), &[], &matching_labels());
    assert_eq!(action, ClaimAction::Adopt);
}

#[test]
fn no_adoption_when_the_parent_is_being_deleted() {
    let mut parent = parent();
    parent.metadata.deletion_timestamp = Some(Time(Utc::now()));
    let action = claim_action(&parent, &[], &matching_labels());
    assert_ne!(action, ClaimAction::Adopt);
}

#[test]
fn unselected_child_with_our_stale_ref_is_released() {
    let mut stale_ref = controller_ref(UID);
    stale_ref.controller = None;
    let action = claim_action(
        &parent(),
        &[stale_ref],
        &BTreeMap::from([("role".to_string(), "proxy".to_string())]),
    );
    assert_eq!(action, ClaimAction::Release);
}

#[test]
fn unrelated_child_is_left_alone() {
    let action = claim_action(
        &parent(),
        &[],
        &BTreeMap::from([("role".to_string(), "proxy".to_string())]),
    );
    assert_eq!(action, ClaimAction::NoOp);
}

// ============================================================================
// Delete-path ownership rule
// ============================================================================

fn statefulset(
    owner_refs: Vec<OwnerReference>,
    annotations: BTreeMap<String, String>,
) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some("foo".to_string()),
            namespace: Some("shoot--dev--foo".to_string()),
            owner_references: if owner_refs.is_empty() {
                None
            } else {
                Some(owner_refs)
            },
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn workload_with_matching_owner_uid_may_be_deleted() {
    let sts = statefulset(vec![controller_ref(UID)], BTreeMap::new());
    assert!(can_delete_statefulset(&sts, &parent()));
}

#[test]
fn workload_with_matching_annotation_pair_may_be_deleted() {
    let annotations = BTreeMap::from([
        (
            OWNED_BY_ANNOTATION.to_string(),
            "shoot--dev--foo/foo".to_string(),
        ),
        (OWNER_TYPE_ANNOTATION.to_string(), "etcd".to_string()),
    ]);
    let sts = statefulset(vec![], annotations);
    assert!(can_delete_statefulset(&sts, &parent()));
}

#[test]
fn workload_of_another_parent_is_never_deleted() {
    let sts = statefulset(vec![controller_ref(OTHER_UID)], BTreeMap::new());
    assert!(!can_delete_statefulset(&sts, &parent()));
}

#[test]
fn annotation_pair_must_match_both_keys() {
    let only_owned_by = BTreeMap::from([(
        OWNED_BY_ANNOTATION.to_string(),
        "shoot--dev--foo/foo".to_string(),
    )]);
    assert!(!can_delete_statefulset(
        &statefulset(vec![], only_owned_by),
        &parent()
    ));

    let wrong_namespace = BTreeMap::from([
        (OWNED_BY_ANNOTATION.to_string(), "other/foo".to_string()),
        (OWNER_TYPE_ANNOTATION.to_string(), "etcd".to_string()),
    ]);
    assert!(!can_delete_statefulset(
        &statefulset(vec![], wrong_namespace),
        &parent()
    ));
}

#[test]
fn unowned_workload_is_never_deleted() {
    let sts = statefulset(vec![], BTreeMap::new());
    assert!(!can_delete_statefulset(&sts, &parent()));
}
