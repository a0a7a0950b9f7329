//! Tests for the chart renderer: artifact paths and decoded child shapes

use std::collections::BTreeMap;

use etcd_druid_operator::adapters::chart::{
    self, CONFIGMAP_CHART_PATH, SERVICE_CHART_PATH, STATEFULSET_CHART_PATH,
};
use etcd_druid_operator::adapters::images::{ImageSource, ImageVector};
use etcd_druid_operator::adapters::values::{self, Values};
use etcd_druid_operator::crd::{
    BackupSpec, Etcd, EtcdConfig, EtcdSpec, LabelSelector, SecretRef, StoreSpec, TlsConfig,
};
use kube::ResourceExt;

// ============================================================================
// Test Helpers
// ============================================================================

const UID: &str = "a1b2c3d4-0000-4000-8000-000000000001";

fn minimal_spec() -> EtcdSpec {
    let labels = BTreeMap::from([
        ("role".to_string(), "etcd".to_string()),
        ("instance".to_string(), "foo".to_string()),
    ]);
    EtcdSpec {
        selector: LabelSelector {
            match_labels: labels.clone(),
            match_expressions: vec![],
        },
        labels,
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

fn assembled(spec: EtcdSpec) -> Values {
    values::assemble(&etcd_with(spec), &catalog()).unwrap()
}

// ============================================================================
// Artifact paths
// ============================================================================

#[test]
fn render_produces_exactly_the_three_required_paths() {
    let rendered = chart::render(&assembled(minimal_spec())).unwrap();
    let paths: Vec<&String> = rendered.files().keys().collect();
    assert_eq!(
        paths,
        vec![
            CONFIGMAP_CHART_PATH,
            SERVICE_CHART_PATH,
            STATEFULSET_CHART_PATH
        ]
    );
}

#[test]
fn rendered_artifacts_decode_into_the_mandated_names() {
    let rendered = chart::render(&assembled(minimal_spec())).unwrap();

    assert_eq!(rendered.service().unwrap().name_any(), "foo-client");
    assert_eq!(
        rendered.config_map().unwrap().name_any(),
        "etcd-bootstrap-a1b2c3"
    );
    assert_eq!(rendered.statefulset().unwrap().name_any(), "foo");
}

// ============================================================================
// Service shape
// ============================================================================

#[test]
fn service_exposes_the_client_and_backup_ports() {
    let rendered = chart::render(&assembled(minimal_spec())).unwrap();
    let service = rendered.service().unwrap();
    let spec = service.spec.expect("service spec expected");

    assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
    let ports = spec.ports.expect("service ports expected");
    assert_eq!(ports.len(), 2);
    assert_eq!(ports[0].port, 2379);
    assert_eq!(ports[1].port, 8080);
}

#[test]
fn children_carry_a_controller_owner_reference() {
    let rendered = chart::render(&assembled(minimal_spec())).unwrap();
    for owner_refs in [
        rendered.service().unwrap().owner_references().to_vec(),
        rendered.config_map().unwrap().owner_references().to_vec(),
        rendered.statefulset().unwrap().owner_references().to_vec(),
    ] {
        assert_eq!(owner_refs.len(), 1);
        assert_eq!(owner_refs[0].uid, UID);
        assert_eq!(owner_refs[0].controller, Some(true));
        assert_eq!(owner_refs[0].block_owner_deletion, Some(true));
        assert_eq!(owner_refs[0].kind, "Etcd");
    }
}

// ============================================================================
// ConfigMap shape
// ============================================================================

#[test]
fn config_map_carries_the_etcd_configuration() {
    let rendered = chart::render(&assembled(minimal_spec())).unwrap();
    let config_map = rendered.config_map().unwrap();
    let data = config_map.data.expect("config map data expected");
    let config = data.get("etcd.conf.yaml").expect("etcd.conf.yaml expected");

    assert!(config.contains("quota-backend-bytes: 8589934592"));
    assert!(config.contains("auto-compaction-retention: 30m"));
    assert!(config.contains("listen-client-urls: http://0.0.0.0:2379"));
}

#[test]
fn tls_switches_the_config_to_https_and_client_auth() {
    let mut spec = minimal_spec();
    spec.etcd.tls = Some(TlsConfig {
        server_tls_secret_ref: SecretRef {
            name: "server".to_string(),
        },
        client_tls_secret_ref: SecretRef {
            name: "client".to_string(),
        },
        tls_ca_secret_ref: SecretRef {
            name: "ca".to_string(),
        },
    });

    let rendered = chart::render(&assembled(spec)).unwrap();
    let data = rendered.config_map().unwrap().data.unwrap();
    let config = data.get("etcd.conf.yaml").unwrap();

    assert!(config.contains("listen-client-urls: https://0.0.0.0:2379"));
    assert!(config.contains("client-cert-auth: true"));
}

// ============================================================================
// StatefulSet shape
// ============================================================================

#[test]
fn statefulset_runs_etcd_with_the_backup_sidecar() {
    let rendered = chart::render(&assembled(minimal_spec())).unwrap();
    let sts = rendered.statefulset().unwrap();
    let spec = sts.spec.expect("statefulset spec expected");

    assert_eq!(spec.replicas, Some(1));
    assert_eq!(spec.service_name, "foo-client");

    let pod_spec = spec.template.spec.expect("pod spec expected");
    let names: Vec<&str> = pod_spec.containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["etcd", "backup-restore"]);

    let vcts = spec.volume_claim_templates.expect("vct expected");
    assert_eq!(vcts.len(), 1);
    assert_eq!(vcts[0].name_any(), "foo");
    let storage = vcts[0]
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|req| req.get("storage"))
        .expect("storage request expected");
    assert_eq!(storage.0, "16Gi");
}

#[test]
fn pod_template_is_stamped_with_the_config_checksum() {
    let values = assembled(minimal_spec());
    let rendered = chart::render(&values).unwrap();
    let sts = rendered.statefulset().unwrap();
    let annotations = sts
        .spec
        .unwrap()
        .template
        .metadata
        .unwrap()
        .annotations
        .unwrap();
    assert!(annotations.contains_key("checksum/etcd-configmap"));

    let again = chart::render(&values).unwrap().statefulset().unwrap();
    let annotations_again = again
        .spec
        .unwrap()
        .template
        .metadata
        .unwrap()
        .annotations
        .unwrap();
    assert_eq!(
        annotations.get("checksum/etcd-configmap"),
        annotations_again.get("checksum/etcd-configmap")
    );
}

#[test]
fn zero_replicas_render_a_scaled_down_statefulset() {
    let mut spec = minimal_spec();
    spec.replicas = 0;
    let rendered = chart::render(&assembled(spec)).unwrap();
    let sts = rendered.statefulset().unwrap();
    assert_eq!(sts.spec.unwrap().replicas, Some(0));
}

#[test]
fn store_binding_wires_the_sidecar_flags() {
    let mut spec = minimal_spec();
    spec.backup.store = Some(StoreSpec {
        provider: Some("gcp".to_string()),
        prefix: "backups/foo".to_string(),
        container: Some("snapshots".to_string()),
        secret_ref: Some(SecretRef {
            name: "store-secret".to_string(),
        }),
    });

    let rendered = chart::render(&assembled(spec)).unwrap();
    let sts = rendered.statefulset().unwrap();
    let pod_spec = sts.spec.unwrap().template.spec.unwrap();
    let sidecar = pod_spec
        .containers
        .iter()
        .find(|c| c.name == "backup-restore")
        .expect("sidecar expected");

    let command = sidecar.command.clone().unwrap_or_default();
    assert!(command.contains(&"--storage-provider=GCS".to_string()));
    assert!(command.contains(&"--store-prefix=backups/foo".to_string()));

    let env = sidecar.env.clone().unwrap_or_default();
    assert!(env
        .iter()
        .any(|e| e.name == "STORAGE_CONTAINER" && e.value.as_deref() == Some("snapshots")));

    let volumes = pod_spec.volumes.unwrap_or_default();
    assert!(volumes.iter().any(|v| v.name == "etcd-backup-store"));
}

#[test]
fn tls_bundle_mounts_secret_volumes_into_both_containers() {
    let mut spec = minimal_spec();
    spec.etcd.tls = Some(TlsConfig {
        server_tls_secret_ref: SecretRef {
            name: "server".to_string(),
        },
        client_tls_secret_ref: SecretRef {
            name: "client".to_string(),
        },
        tls_ca_secret_ref: SecretRef {
            name: "ca".to_string(),
        },
    });

    let rendered = chart::render(&assembled(spec)).unwrap();
    let pod_spec = rendered
        .statefulset()
        .unwrap()
        .spec
        .unwrap()
        .template
        .spec
        .unwrap();

    let volume_names: Vec<&str> = pod_spec
        .volumes
        .as_ref()
        .unwrap()
        .iter()
        .map(|v| v.name.as_str())
        .collect();
    assert!(volume_names.contains(&"etcd-server-tls"));
    assert!(volume_names.contains(&"etcd-client-tls"));
    assert!(volume_names.contains(&"etcd-ca-tls"));

    let etcd_mounts: Vec<&str> = pod_spec.containers[0]
        .volume_mounts
        .as_ref()
        .unwrap()
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert!(etcd_mounts.contains(&"etcd-server-tls"));

    let sidecar_mounts: Vec<&str> = pod_spec.containers[1]
        .volume_mounts
        .as_ref()
        .unwrap()
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert!(sidecar_mounts.contains(&"etcd-client-tls"));
}
