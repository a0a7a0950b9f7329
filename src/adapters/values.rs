//! Projection of an Etcd spec into the flat values consumed by the renderer

use serde::Serialize;
use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::adapters::images::{ImageVector, BACKUP_RESTORE_IMAGE_KEY, ETCD_IMAGE_KEY};
use crate::crd::{
    AutoCompactionMode, Etcd, GarbageCollectionPolicy, LabelSelector, MetricsLevel,
    ResourceRequirements,
};
use crate::utils::{parse_quantity, storage_provider, uid_suffix};
use crate::{Error, Result};

/// Backend storage quota applied when the spec leaves it unset
pub const DEFAULT_QUOTA: &str = "8Gi";
/// Delta-snapshot memory limit applied when the spec leaves it unset
pub const DEFAULT_DELTA_SNAPSHOT_MEMORY_LIMIT: &str = "100Mi";
/// Persistent-volume capacity applied when the spec leaves it unset
pub const DEFAULT_STORAGE_CAPACITY: &str = "16Gi";
/// Auto-compaction retention applied when the spec leaves it unset
pub const DEFAULT_AUTO_COMPACTION_RETENTION: &str = "30m";
/// Default etcd client port
pub const DEFAULT_CLIENT_PORT: i32 = 2379;
/// Default etcd peer port
pub const DEFAULT_SERVER_PORT: i32 = 2380;
/// Default backup-restore server port
pub const DEFAULT_BACKUP_PORT: i32 = 8080;

const ETCD_CONNECTION_TIMEOUT: &str = "5m";
const SNAPSTORE_TEMP_DIR: &str = "/var/etcd/data/temp";
const PULL_POLICY: &str = "IfNotPresent";

/// Values handed to the renderer. Field order is fixed, so serializing two
/// assemblies of the same spec yields identical bytes.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Values {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub selector: LabelSelector,
    pub replicas: i32,
    pub statefulset_replicas: i32,
    pub service_name: String,
    pub config_map_name: String,
    pub volume_claim_template_name: String,
    pub storage_capacity: String,
    pub storage_class: Option<String>,
    pub priority_class_name: Option<String>,
    pub etcd: EtcdValues,
    pub backup: BackupValues,
    pub shared_config: SharedConfigValues,
    pub tls: Option<TlsValues>,
    pub store: Option<StoreValues>,
}

/// Values for the etcd container
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EtcdValues {
    pub image: String,
    pub pull_policy: String,
    pub client_port: i32,
    pub server_port: i32,
    pub metrics_level: String,
    pub defragmentation_schedule: Option<String>,
    pub quota_bytes: i64,
    pub resources: Option<ResourceRequirements>,
}

/// Values for the backup-restore sidecar
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupValues {
    pub image: String,
    pub pull_policy: String,
    pub port: i32,
    pub full_snapshot_schedule: Option<String>,
    pub delta_snapshot_period: Option<String>,
    pub delta_snapshot_memory_limit_bytes: i64,
    pub garbage_collection_policy: Option<String>,
    pub garbage_collection_period: Option<String>,
    pub etcd_connection_timeout: String,
    pub snapstore_temp_dir: String,
    pub compression: Option<CompressionValues>,
    pub resources: Option<ResourceRequirements>,
}

/// Snapshot compression values
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionValues {
    pub enabled: bool,
    pub policy: Option<String>,
}

/// Values shared between etcd and the sidecar
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedConfigValues {
    pub auto_compaction_mode: String,
    pub auto_compaction_retention: String,
}

/// TLS secret names, present only when the spec carries the bundle
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsValues {
    pub server_secret: String,
    pub client_secret: String,
    pub ca_secret: String,
}

/// Object-store values, present only when the spec binds a store
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreValues {
    pub provider: String,
    pub prefix: String,
    pub container: Option<String>,
    pub secret: Option<String>,
}

/// Validate the parts of an Etcd spec the assembler depends on.
pub fn validate(etcd: &Etcd) -> Result<()> {
    if !matches!(etcd.spec.replicas, 0 | 1) {
        return Err(Error::ValidationError(format!(
            "replicas must be 0 or 1, got {}",
            etcd.spec.replicas
        )));
    }
    Ok(())
}

/// Project an Etcd spec, defaults, and the image vector into renderer values.
pub fn assemble(etcd: &Etcd, images: &ImageVector) -> Result<Values> {
    validate(etcd)?;

    let name = etcd.name_any();
    let namespace = etcd.namespace().unwrap_or_default();
    let uid = etcd
        .metadata
        .uid
        .clone()
        .ok_or_else(|| Error::ValidationError(format!("etcd {} has no uid", name)))?;
    let spec = &etcd.spec;

    let etcd_image = match &spec.etcd.image {
        Some(image) => image.clone(),
        None => images
            .find(ETCD_IMAGE_KEY)
            .map(|img| img.image_ref())
            .ok_or_else(|| {
                Error::ImageError(format!(
                    "either the etcd resource or the image vector must provide the {} image",
                    ETCD_IMAGE_KEY
                ))
            })?,
    };
    let backup_image = match &spec.backup.image {
        Some(image) => image.clone(),
        None => images
            .find(BACKUP_RESTORE_IMAGE_KEY)
            .map(|img| img.image_ref())
            .ok_or_else(|| {
                Error::ImageError(format!(
                    "either the etcd resource or the image vector must provide the {} image",
                    BACKUP_RESTORE_IMAGE_KEY
                ))
            })?,
    };

    let quota_bytes = parse_quantity(spec.etcd.quota.as_deref().unwrap_or(DEFAULT_QUOTA))?;
    let delta_snapshot_memory_limit_bytes = parse_quantity(
        spec.backup
            .delta_snapshot_memory_limit
            .as_deref()
            .unwrap_or(DEFAULT_DELTA_SNAPSHOT_MEMORY_LIMIT),
    )?;

    let metrics_level = match spec.etcd.metrics.unwrap_or(MetricsLevel::Basic) {
        MetricsLevel::Basic => "basic",
        MetricsLevel::Extensive => "extensive",
    };

    let shared = spec.shared_config.clone().unwrap_or_default();
    let auto_compaction_mode = match shared
        .auto_compaction_mode
        .unwrap_or(AutoCompactionMode::Periodic)
    {
        AutoCompactionMode::Periodic => "periodic",
        AutoCompactionMode::Revision => "revision",
    };

    let store = match &spec.backup.store {
        Some(store) => Some(StoreValues {
            provider: storage_provider(store.provider.as_deref())?,
            prefix: store.prefix.clone(),
            container: store.container.clone(),
            secret: store.secret_ref.as_ref().map(|s| s.name.clone()),
        }),
        None => None,
    };

    Ok(Values {
        service_name: format!("{}-client", name),
        config_map_name: format!("etcd-bootstrap-{}", uid_suffix(&uid)?),
        volume_claim_template_name: spec
            .volume_claim_template
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| name.clone()),
        storage_capacity: spec
            .storage_capacity
            .clone()
            .unwrap_or_else(|| DEFAULT_STORAGE_CAPACITY.to_string()),
        storage_class: spec.storage_class.clone(),
        priority_class_name: spec.priority_class_name.clone(),
        labels: spec.labels.clone(),
        annotations: spec.annotations.clone(),
        selector: spec.selector.clone(),
        replicas: spec.replicas,
        statefulset_replicas: if spec.replicas != 0 { 1 } else { 0 },
        etcd: EtcdValues {
            image: etcd_image,
            pull_policy: PULL_POLICY.to_string(),
            client_port: spec.etcd.client_port.unwrap_or(DEFAULT_CLIENT_PORT),
            server_port: spec.etcd.server_port.unwrap_or(DEFAULT_SERVER_PORT),
            metrics_level: metrics_level.to_string(),
            defragmentation_schedule: spec.etcd.defragmentation_schedule.clone(),
            quota_bytes,
            resources: spec.etcd.resources.clone(),
        },
        backup: BackupValues {
            image: backup_image,
            pull_policy: PULL_POLICY.to_string(),
            port: spec.backup.port.unwrap_or(DEFAULT_BACKUP_PORT),
            full_snapshot_schedule: spec.backup.full_snapshot_schedule.clone(),
            delta_snapshot_period: spec.backup.delta_snapshot_period.clone(),
            delta_snapshot_memory_limit_bytes,
            garbage_collection_policy: spec.backup.garbage_collection_policy.map(|p| {
                match p {
                    GarbageCollectionPolicy::Exponential => "Exponential".to_string(),
                    GarbageCollectionPolicy::LimitBased => "LimitBased".to_string(),
                }
            }),
            garbage_collection_period: spec.backup.garbage_collection_period.clone(),
            etcd_connection_timeout: ETCD_CONNECTION_TIMEOUT.to_string(),
            snapstore_temp_dir: SNAPSTORE_TEMP_DIR.to_string(),
            compression: spec.backup.compression.as_ref().map(|c| CompressionValues {
                enabled: c.enabled,
                policy: c.policy.map(|p| {
                    match p {
                        crate::crd::CompressionPolicy::Gzip => "gzip".to_string(),
                        crate::crd::CompressionPolicy::Lzw => "lzw".to_string(),
                        crate::crd::CompressionPolicy::Zlib => "zlib".to_string(),
                    }
                }),
            }),
            resources: spec.backup.resources.clone(),
        },
        shared_config: SharedConfigValues {
            auto_compaction_mode: auto_compaction_mode.to_string(),
            auto_compaction_retention: shared
                .auto_compaction_retention
                .unwrap_or_else(|| DEFAULT_AUTO_COMPACTION_RETENTION.to_string()),
        },
        tls: spec.etcd.tls.as_ref().map(|tls| TlsValues {
            server_secret: tls.server_tls_secret_ref.name.clone(),
            client_secret: tls.client_tls_secret_ref.name.clone(),
            ca_secret: tls.tls_ca_secret_ref.name.clone(),
        }),
        store,
        name,
        namespace,
        uid,
    })
}
