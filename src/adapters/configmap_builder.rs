//! Bootstrap ConfigMap carrying the etcd configuration file

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_yaml::{Mapping, Value as Yaml};
use std::collections::BTreeMap;

use crate::adapters::chart::owner_reference;
use crate::adapters::values::Values;
use crate::{Error, Result};

/// File name of the etcd configuration inside the ConfigMap
pub const ETCD_CONFIG_FILE: &str = "etcd.conf.yaml";

const DATA_DIR: &str = "/var/etcd/data/new.etcd";

/// Build the bootstrap ConfigMap mounted into the etcd container.
pub fn build_config_map(values: &Values) -> Result<ConfigMap> {
    let mut data = BTreeMap::new();
    data.insert(ETCD_CONFIG_FILE.to_string(), etcd_config_yaml(values)?);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(values.config_map_name.clone()),
            namespace: Some(values.namespace.clone()),
            labels: Some(values.labels.clone()),
            owner_references: Some(vec![owner_reference(values)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Render the etcd configuration file from the assembled values.
pub fn etcd_config_yaml(values: &Values) -> Result<String> {
    let scheme = if values.tls.is_some() { "https" } else { "http" };
    let mut config = Mapping::new();

    config.insert(
        Yaml::String("name".to_string()),
        Yaml::String(format!("etcd-{}", values.name)),
    );
    config.insert(
        Yaml::String("data-dir".to_string()),
        Yaml::String(DATA_DIR.to_string()),
    );
    config.insert(
        Yaml::String("metrics".to_string()),
        Yaml::String(values.etcd.metrics_level.clone()),
    );
    config.insert(
        Yaml::String("snapshot-count".to_string()),
        Yaml::Number(75_000u32.into()),
    );
    config.insert(Yaml::String("enable-v2".to_string()), Yaml::Bool(false));
    config.insert(
        Yaml::String("quota-backend-bytes".to_string()),
        Yaml::Number(values.etcd.quota_bytes.into()),
    );
    config.insert(
        Yaml::String("listen-client-urls".to_string()),
        Yaml::String(format!("{}://0.0.0.0:{}", scheme, values.etcd.client_port)),
    );
    config.insert(
        Yaml::String("advertise-client-urls".to_string()),
        Yaml::String(format!(
            "{}://{}.{}.svc:{}",
            scheme, values.service_name, values.namespace, values.etcd.client_port
        )),
    );
    config.insert(
        Yaml::String("listen-peer-urls".to_string()),
        Yaml::String(format!("http://0.0.0.0:{}", values.etcd.server_port)),
    );
    config.insert(
        Yaml::String("initial-cluster-token".to_string()),
        Yaml::String("initial".to_string()),
    );
    config.insert(
        Yaml::String("initial-cluster-state".to_string()),
        Yaml::String("new".to_string()),
    );
    config.insert(
        Yaml::String("auto-compaction-mode".to_string()),
        Yaml::String(values.shared_config.auto_compaction_mode.clone()),
    );
    config.insert(
        Yaml::String("auto-compaction-retention".to_string()),
        Yaml::String(values.shared_config.auto_compaction_retention.clone()),
    );

    if values.tls.is_some() {
        let mut client_security = Mapping::new();
        client_security.insert(
            Yaml::String("cert-file".to_string()),
            Yaml::String("/var/etcd/ssl/server/tls.crt".to_string()),
        );
        client_security.insert(
            Yaml::String("key-file".to_string()),
            Yaml::String("/var/etcd/ssl/server/tls.key".to_string()),
        );
        client_security.insert(
            Yaml::String("client-cert-auth".to_string()),
            Yaml::Bool(true),
        );
        client_security.insert(
            Yaml::String("trusted-ca-file".to_string()),
            Yaml::String("/var/etcd/ssl/ca/ca.crt".to_string()),
        );
        config.insert(
            Yaml::String("client-transport-security".to_string()),
            Yaml::Mapping(client_security),
        );
    }

    serde_yaml::to_string(&Yaml::Mapping(config))
        .map_err(|e| Error::RenderError(format!("failed to serialize etcd config: {}", e)))
}
