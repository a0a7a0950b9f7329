//! Etcd Custom Resource Definition

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group of the Etcd resource
pub const API_GROUP: &str = "druid.gardener.cloud";
/// Full apiVersion of the Etcd resource
pub const API_VERSION: &str = "druid.gardener.cloud/v1alpha1";
/// Kind of the Etcd resource
pub const KIND: &str = "Etcd";

/// Annotation marking a child as owned by an Etcd, value `<namespace>/<name>`
pub const OWNED_BY_ANNOTATION: &str = "gardener.cloud/owned-by";
/// Annotation carrying the owner kind, value [`OWNER_TYPE`]
pub const OWNER_TYPE_ANNOTATION: &str = "gardener.cloud/owner-type";
/// Owner type recorded in [`OWNER_TYPE_ANNOTATION`]
pub const OWNER_TYPE: &str = "etcd";
/// Annotation whose presence requests a reconcile pass and whose removal
/// acknowledges completion
pub const OPERATION_ANNOTATION: &str = "gardener.cloud/operation";

/// Etcd resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "druid.gardener.cloud",
    version = "v1alpha1",
    kind = "Etcd",
    plural = "etcds",
    singular = "etcd",
    namespaced,
    status = "EtcdStatus",
    printcolumn = r#"{"name": "Ready", "type": "string", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    /// Label-match expression used to find child objects
    pub selector: LabelSelector,

    /// Labels propagated to children
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations propagated to children
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Declared replica count; only 0 and 1 are honoured
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Main etcd container configuration
    pub etcd: EtcdConfig,

    /// Backup-restore sidecar configuration
    pub backup: BackupSpec,

    /// Configuration shared between etcd and the sidecar
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_config: Option<SharedConfig>,

    /// Name override for the volume claim template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<String>,

    /// Storage class of the per-replica persistent volume claim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Capacity of the per-replica persistent volume claim (default 16Gi)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_capacity: Option<String>,

    /// Priority class for the workload pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

/// Label selector, mirroring the Kubernetes meta/v1 shape
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels that must match exactly
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// Set-based match requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// A single set-based selector requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// Label key the requirement applies to
    pub key: String,

    /// One of In, NotIn, Exists, DoesNotExist
    pub operator: String,

    /// Values for In / NotIn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Main etcd container configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    /// Image reference; resolved from the image vector if absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// TLS bundle; plaintext when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Client port override (default 2379)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_port: Option<i32>,

    /// Server/peer port override (default 2380)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_port: Option<i32>,

    /// Resource budget of the etcd container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Metrics level exposed by etcd
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsLevel>,

    /// Cron schedule for defragmentation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defragmentation_schedule: Option<String>,

    /// Backend storage quota (default 8Gi)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<String>,
}

/// References to the three TLS secrets
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct TlsConfig {
    /// Server certificate and key
    #[serde(rename = "serverTLSSecretRef")]
    pub server_tls_secret_ref: SecretRef,

    /// Client certificate and key
    #[serde(rename = "clientTLSSecretRef")]
    pub client_tls_secret_ref: SecretRef,

    /// CA bundle
    #[serde(rename = "tlsCASecretRef")]
    pub tls_ca_secret_ref: SecretRef,
}

/// Reference to a secret in the parent namespace
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
}

/// Metrics level exposed by etcd
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsLevel {
    Basic,
    Extensive,
}

/// Resource budget (quantity strings keyed by resource name)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Resource limits (cpu, memory)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,

    /// Resource requests (cpu, memory)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

/// Backup-restore sidecar configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Image reference; resolved from the image vector if absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Sidecar server port (default 8080)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Resource budget of the sidecar container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Cron schedule for full snapshots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_snapshot_schedule: Option<String>,

    /// Period between delta snapshots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_snapshot_period: Option<String>,

    /// Memory limit accumulating delta events (default 100Mi)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_snapshot_memory_limit: Option<String>,

    /// Snapshot garbage-collection policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub garbage_collection_policy: Option<GarbageCollectionPolicy>,

    /// Period between garbage-collection runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub garbage_collection_period: Option<String>,

    /// Snapshot compression settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionSpec>,

    /// Object-store binding for snapshots
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreSpec>,
}

/// Snapshot garbage-collection policy
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum GarbageCollectionPolicy {
    Exponential,
    LimitBased,
}

/// Snapshot compression settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompressionSpec {
    /// Whether snapshots are compressed before upload
    #[serde(default)]
    pub enabled: bool,

    /// Compression algorithm
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<CompressionPolicy>,
}

/// Compression algorithm
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionPolicy {
    Gzip,
    Lzw,
    Zlib,
}

/// Object-store binding for snapshots
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// Provider tag, cloud-specific short name or canonical
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Prefix inside the container under which snapshots are stored
    pub prefix: String,

    /// Bucket/container name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Secret carrying the store credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

/// Configuration shared between etcd and the sidecar
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SharedConfig {
    /// Auto-compaction mode (default periodic)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_compaction_mode: Option<AutoCompactionMode>,

    /// Auto-compaction retention (default "30m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_compaction_retention: Option<String>,
}

/// Auto-compaction mode
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AutoCompactionMode {
    Periodic,
    Revision,
}

/// Etcd status subresource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EtcdStatus {
    /// Generation observed by the last successful reconcile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Reference to the managed workload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etcd: Option<CrossVersionObjectReference>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Name of the client service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Message of the last reconcile error, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// When the last error was recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,

    /// Whether the workload passed the readiness checks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,

    /// Ready replicas of the workload
    #[serde(default)]
    pub ready_replicas: i32,

    /// Current replicas of the workload
    #[serde(default)]
    pub current_replicas: i32,

    /// Updated replicas of the workload
    #[serde(default)]
    pub updated_replicas: i32,
}

/// Reference to a child object, pinned by kind and name
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossVersionObjectReference {
    /// apiVersion of the referenced object
    pub api_version: String,

    /// Kind of the referenced object
    pub kind: String,

    /// Name of the referenced object
    pub name: String,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Etcd {
    /// Controller owner reference pointing at this Etcd
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            name: self.name_any(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Value of the owned-by annotation, `<namespace>/<name>`
    pub fn owned_by_value(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
