//! StatefulSet manifest: etcd plus the backup-restore sidecar

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretVolumeSource, TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, LabelSelectorRequirement, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::adapters::chart::owner_reference;
use crate::adapters::configmap_builder;
use crate::adapters::values::Values;
use crate::crd;
use crate::Result;

const DATA_DIR: &str = "/var/etcd/data/new.etcd";
const DATA_MOUNT_PATH: &str = "/var/etcd/data";
const CONFIG_MOUNT_PATH: &str = "/var/etcd/config";

/// Build the StatefulSet running etcd with the backup-restore sidecar.
pub fn build_statefulset(values: &Values) -> Result<StatefulSet> {
    let config_checksum = config_checksum(values)?;

    let mut pod_labels = values.labels.clone();
    for (k, v) in &values.selector.match_labels {
        pod_labels.entry(k.clone()).or_insert_with(|| v.clone());
    }

    let mut pod_annotations = values.annotations.clone();
    pod_annotations.insert("checksum/etcd-configmap".to_string(), config_checksum);

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(values.name.clone()),
            namespace: Some(values.namespace.clone()),
            labels: Some(values.labels.clone()),
            annotations: if values.annotations.is_empty() {
                None
            } else {
                Some(values.annotations.clone())
            },
            owner_references: Some(vec![owner_reference(values)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(values.statefulset_replicas),
            selector: selector_for(values),
            service_name: values.service_name.clone(),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(values)),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(values.volume_claim_template_name.clone()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: values.storage_class.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(values.storage_capacity.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn selector_for(values: &Values) -> LabelSelector {
    LabelSelector {
        match_labels: if values.selector.match_labels.is_empty() {
            None
        } else {
            Some(values.selector.match_labels.clone())
        },
        match_expressions: if values.selector.match_expressions.is_empty() {
            None
        } else {
            Some(
                values
                    .selector
                    .match_expressions
                    .iter()
                    .map(|req| LabelSelectorRequirement {
                        key: req.key.clone(),
                        operator: req.operator.clone(),
                        values: if req.values.is_empty() {
                            None
                        } else {
                            Some(req.values.clone())
                        },
                    })
                    .collect(),
            )
        },
    }
}

fn build_pod_spec(values: &Values) -> PodSpec {
    let mut volumes = vec![Volume {
        name: "etcd-config-file".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: values.config_map_name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }];

    if let Some(tls) = &values.tls {
        for (volume, secret) in [
            ("etcd-server-tls", &tls.server_secret),
            ("etcd-client-tls", &tls.client_secret),
            ("etcd-ca-tls", &tls.ca_secret),
        ] {
            volumes.push(Volume {
                name: volume.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }

    if let Some(store) = &values.store {
        if let Some(secret) = &store.secret {
            volumes.push(Volume {
                name: "etcd-backup-store".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }

    PodSpec {
        containers: vec![build_etcd_container(values), build_backup_container(values)],
        volumes: Some(volumes),
        priority_class_name: values.priority_class_name.clone(),
        ..Default::default()
    }
}

fn build_etcd_container(values: &Values) -> Container {
    let mut volume_mounts = vec![
        VolumeMount {
            name: values.volume_claim_template_name.clone(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "etcd-config-file".to_string(),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    if values.tls.is_some() {
        volume_mounts.extend([
            VolumeMount {
                name: "etcd-server-tls".to_string(),
                mount_path: "/var/etcd/ssl/server".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "etcd-ca-tls".to_string(),
                mount_path: "/var/etcd/ssl/ca".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]);
    }

    Container {
        name: "etcd".to_string(),
        image: Some(values.etcd.image.clone()),
        image_pull_policy: Some(values.etcd.pull_policy.clone()),
        command: Some(vec![
            "etcd".to_string(),
            format!(
                "--config-file={}/{}",
                CONFIG_MOUNT_PATH,
                configmap_builder::ETCD_CONFIG_FILE
            ),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("server".to_string()),
                container_port: values.etcd.server_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("client".to_string()),
                container_port: values.etcd.client_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        readiness_probe: Some(tcp_probe("client", 5, 5)),
        liveness_probe: Some(tcp_probe("client", 15, 10)),
        resources: resources_for(values.etcd.resources.as_ref()),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

fn build_backup_container(values: &Values) -> Container {
    let mut command = vec![
        "etcdbrctl".to_string(),
        "server".to_string(),
        format!("--data-dir={}", DATA_DIR),
        format!("--server-port={}", values.backup.port),
        format!("--embedded-etcd-quota-bytes={}", values.etcd.quota_bytes),
        format!(
            "--etcd-connection-timeout={}",
            values.backup.etcd_connection_timeout
        ),
        format!(
            "--delta-snapshot-memory-limit={}",
            values.backup.delta_snapshot_memory_limit_bytes
        ),
        format!("--snapstore-temp-directory={}", values.backup.snapstore_temp_dir),
        format!(
            "--endpoints={}://{}.{}.svc:{}",
            if values.tls.is_some() { "https" } else { "http" },
            values.service_name,
            values.namespace,
            values.etcd.client_port
        ),
    ];

    if let Some(schedule) = &values.backup.full_snapshot_schedule {
        command.push(format!("--schedule={}", schedule));
    }
    if let Some(period) = &values.backup.delta_snapshot_period {
        command.push(format!("--delta-snapshot-period={}", period));
    }
    if let Some(policy) = &values.backup.garbage_collection_policy {
        command.push(format!("--garbage-collection-policy={}", policy));
    }
    if let Some(period) = &values.backup.garbage_collection_period {
        command.push(format!("--garbage-collection-period={}", period));
    }
    if let Some(schedule) = &values.etcd.defragmentation_schedule {
        command.push(format!("--defragmentation-schedule={}", schedule));
    }
    if let Some(compression) = &values.backup.compression {
        command.push(format!("--compress-snapshots={}", compression.enabled));
        if let Some(policy) = &compression.policy {
            command.push(format!("--compression-policy={}", policy));
        }
    }
    if let Some(store) = &values.store {
        if !store.provider.is_empty() {
            command.push(format!("--storage-provider={}", store.provider));
        }
        command.push(format!("--store-prefix={}", store.prefix));
    }
    if values.tls.is_some() {
        command.extend([
            "--cert=/var/etcd/ssl/client/tls.crt".to_string(),
            "--key=/var/etcd/ssl/client/tls.key".to_string(),
            "--cacert=/var/etcd/ssl/ca/ca.crt".to_string(),
            "--insecure-transport=false".to_string(),
            "--insecure-skip-tls-verify=false".to_string(),
        ]);
    }

    let mut env = Vec::new();
    if let Some(store) = &values.store {
        if let Some(container) = &store.container {
            env.push(EnvVar {
                name: "STORAGE_CONTAINER".to_string(),
                value: Some(container.clone()),
                ..Default::default()
            });
        }
    }

    let mut volume_mounts = vec![VolumeMount {
        name: values.volume_claim_template_name.clone(),
        mount_path: DATA_MOUNT_PATH.to_string(),
        ..Default::default()
    }];
    if values.tls.is_some() {
        volume_mounts.extend([
            VolumeMount {
                name: "etcd-client-tls".to_string(),
                mount_path: "/var/etcd/ssl/client".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "etcd-ca-tls".to_string(),
                mount_path: "/var/etcd/ssl/ca".to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]);
    }
    if values.store.as_ref().and_then(|s| s.secret.as_ref()).is_some() {
        volume_mounts.push(VolumeMount {
            name: "etcd-backup-store".to_string(),
            mount_path: "/var/etcd/snapstore-secret".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Container {
        name: "backup-restore".to_string(),
        image: Some(values.backup.image.clone()),
        image_pull_policy: Some(values.backup.pull_policy.clone()),
        command: Some(command),
        ports: Some(vec![ContainerPort {
            name: Some("backuprestore".to_string()),
            container_port: values.backup.port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: if env.is_empty() { None } else { Some(env) },
        resources: resources_for(values.backup.resources.as_ref()),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

fn tcp_probe(port: &str, initial_delay: i32, period: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String(port.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn resources_for(resources: Option<&crd::ResourceRequirements>) -> Option<ResourceRequirements> {
    let resources = resources?;
    let quantities = |map: &BTreeMap<String, String>| {
        if map.is_empty() {
            None
        } else {
            Some(
                map.iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect::<BTreeMap<String, Quantity>>(),
            )
        }
    };
    Some(ResourceRequirements {
        limits: quantities(&resources.limits),
        requests: quantities(&resources.requests),
        ..Default::default()
    })
}

fn config_checksum(values: &Values) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(configmap_builder::etcd_config_yaml(values)?.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
