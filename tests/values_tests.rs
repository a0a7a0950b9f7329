//! Tests for the value assembly: defaults, derived names, determinism

use std::collections::BTreeMap;

use etcd_druid_operator::adapters::images::{ImageSource, ImageVector};
use etcd_druid_operator::adapters::values;
use etcd_druid_operator::crd::{
    BackupSpec, Etcd, EtcdConfig, EtcdSpec, LabelSelector, SecretRef, StoreSpec, TlsConfig,
};

// ============================================================================
// Test Helpers
// ============================================================================

const UID: &str = "a1b2c3d4-0000-4000-8000-000000000001";

fn selector() -> LabelSelector {
    LabelSelector {
        match_labels: BTreeMap::from([
            ("role".to_string(), "etcd".to_string()),
            ("instance".to_string(), "foo".to_string()),
        ]),
        match_expressions: vec![],
    }
}

fn minimal_spec() -> EtcdSpec {
    EtcdSpec {
        selector: selector(),
        labels: BTreeMap::from([
            ("role".to_string(), "etcd".to_string()),
            ("instance".to_string(), "foo".to_string()),
        ]),
        annotations: BTreeMap::new(),
        replicas: 1,
        etcd: EtcdConfig::default(),
        backup: BackupSpec::default(),
        shared_config: None,
        volume_claim_template: None,
        storage_class: None,
        storage_capacity: None,
        priority_class_name: None,
    }
}

fn etcd_with(spec: EtcdSpec) -> Etcd {
    let mut etcd = Etcd::new("foo", spec);
    etcd.metadata.namespace = Some("shoot--dev--foo".to_string());
    etcd.metadata.uid = Some(UID.to_string());
    etcd.metadata.generation = Some(1);
    etcd
}

fn catalog() -> ImageVector {
    ImageVector::from_images(vec![
        ImageSource {
            name: "etcd".to_string(),
            repository: "quay.io/coreos/etcd".to_string(),
            tag: "v3.4.13".to_string(),
        },
        ImageSource {
            name: "etcd-backup-restore".to_string(),
            repository: "eu.gcr.io/gardener-project/gardener/etcdbrctl".to_string(),
            tag: "v0.12.1".to_string(),
        },
    ])
}

// ============================================================================
// Defaults
// ============================================================================

#[test]
fn defaults_are_applied_for_absent_fields() {
    let values = values::assemble(&etcd_with(minimal_spec()), &catalog()).unwrap();

    assert_eq!(values.etcd.quota_bytes, 8 * 1024 * 1024 * 1024);
    assert_eq!(
        values.backup.delta_snapshot_memory_limit_bytes,
        100 * 1024 * 1024
    );
    assert_eq!(values.backup.etcd_connection_timeout, "5m");
    assert_eq!(values.backup.snapstore_temp_dir, "/var/etcd/data/temp");
    assert_eq!(values.shared_config.auto_compaction_mode, "periodic");
    assert_eq!(values.shared_config.auto_compaction_retention, "30m");
    assert_eq!(values.storage_capacity, "16Gi");
    assert_eq!(values.etcd.client_port, 2379);
    assert_eq!(values.etcd.server_port, 2380);
    assert_eq!(values.backup.port, 8080);
}

#[test]
fn spec_values_override_defaults() {
    let mut spec = minimal_spec();
    spec.etcd.quota = Some("2Gi".to_string());
    spec.etcd.client_port = Some(12379);
    spec.backup.delta_snapshot_memory_limit = Some("200Mi".to_string());
    spec.storage_capacity = Some("25Gi".to_string());

    let values = values::assemble(&etcd_with(spec), &catalog()).unwrap();

    assert_eq!(values.etcd.quota_bytes, 2 * 1024 * 1024 * 1024);
    assert_eq!(values.etcd.client_port, 12379);
    assert_eq!(
        values.backup.delta_snapshot_memory_limit_bytes,
        200 * 1024 * 1024
    );
    assert_eq!(values.storage_capacity, "25Gi");
}

// ============================================================================
// Derived names
// ============================================================================

#[test]
fn child_names_are_derived_from_parent_identity() {
    let values = values::assemble(&etcd_with(minimal_spec()), &catalog()).unwrap();

    assert_eq!(values.service_name, "foo-client");
    assert_eq!(values.config_map_name, "etcd-bootstrap-a1b2c3");
    assert_eq!(values.name, "foo");
    assert_eq!(values.volume_claim_template_name, "foo");
}

#[test]
fn volume_claim_template_override_wins() {
    let mut spec = minimal_spec();
    spec.volume_claim_template = Some("etcd-data".to_string());
    let values = values::assemble(&etcd_with(spec), &catalog()).unwrap();
    assert_eq!(values.volume_claim_template_name, "etcd-data");
}

// ============================================================================
// Replica projection and validation
// ============================================================================

#[test]
fn zero_replicas_scale_the_statefulset_to_zero() {
    let mut spec = minimal_spec();
    spec.replicas = 0;
    let values = values::assemble(&etcd_with(spec), &catalog()).unwrap();
    assert_eq!(values.statefulset_replicas, 0);
}

#[test]
fn one_replica_maps_to_one_statefulset_replica() {
    let values = values::assemble(&etcd_with(minimal_spec()), &catalog()).unwrap();
    assert_eq!(values.statefulset_replicas, 1);
}

#[test]
fn more_than_one_replica_is_rejected() {
    let mut spec = minimal_spec();
    spec.replicas = 3;
    let result = values::assemble(&etcd_with(spec), &catalog());
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("replicas"));
}

// ============================================================================
// Images
// ============================================================================

#[test]
fn images_fall_back_to_the_catalog() {
    let values = values::assemble(&etcd_with(minimal_spec()), &catalog()).unwrap();
    assert_eq!(values.etcd.image, "quay.io/coreos/etcd:v3.4.13");
    assert_eq!(
        values.backup.image,
        "eu.gcr.io/gardener-project/gardener/etcdbrctl:v0.12.1"
    );
}

#[test]
fn spec_image_overrides_the_catalog() {
    let mut spec = minimal_spec();
    spec.etcd.image = Some("my-registry/etcd:custom".to_string());
    let values = values::assemble(&etcd_with(spec), &catalog()).unwrap();
    assert_eq!(values.etcd.image, "my-registry/etcd:custom");
}

#[test]
fn missing_image_everywhere_is_an_error() {
    let result = values::assemble(&etcd_with(minimal_spec()), &ImageVector::default());
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("image"));
}

// ============================================================================
// TLS and store projection
// ============================================================================

#[test]
fn tls_values_are_absent_without_a_bundle() {
    let values = values::assemble(&etcd_with(minimal_spec()), &catalog()).unwrap();
    assert!(values.tls.is_none());
}

#[test]
fn tls_values_carry_the_three_secret_names() {
    let mut spec = minimal_spec();
    spec.etcd.tls = Some(TlsConfig {
        server_tls_secret_ref: SecretRef {
            name: "etcd-server-cert".to_string(),
        },
        client_tls_secret_ref: SecretRef {
            name: "etcd-client-cert".to_string(),
        },
        tls_ca_secret_ref: SecretRef {
            name: "etcd-ca".to_string(),
        },
    });

    let values = values::assemble(&etcd_with(spec), &catalog()).unwrap();
    let tls = values.tls.expect("tls values expected");
    assert_eq!(tls.server_secret, "etcd-server-cert");
    assert_eq!(tls.client_secret, "etcd-client-cert");
    assert_eq!(tls.ca_secret, "etcd-ca");
}

#[test]
fn store_provider_tags_are_normalised() {
    let mut spec = minimal_spec();
    spec.backup.store = Some(StoreSpec {
        provider: Some("aws".to_string()),
        prefix: "backups/foo".to_string(),
        container: Some("bucket".to_string()),
        secret_ref: Some(SecretRef {
            name: "store-secret".to_string(),
        }),
    });

    let values = values::assemble(&etcd_with(spec), &catalog()).unwrap();
    let store = values.store.expect("store values expected");
    assert_eq!(store.provider, "S3");
    assert_eq!(store.prefix, "backups/foo");
    assert_eq!(store.container.as_deref(), Some("bucket"));
    assert_eq!(store.secret.as_deref(), Some("store-secret"));
}

#[test]
fn unknown_store_provider_is_an_error() {
    let mut spec = minimal_spec();
    spec.backup.store = Some(StoreSpec {
        provider: Some("dropbox".to_string()),
        prefix: "backups/foo".to_string(),
        container: None,
        secret_ref: None,
    });
    assert!(values::assemble(&etcd_with(spec), &catalog()).is_err());
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn assembly_is_deterministic_byte_for_byte() {
    let etcd = etcd_with(minimal_spec());
    let first = values::assemble(&etcd, &catalog()).unwrap();
    let second = values::assemble(&etcd, &catalog()).unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}
