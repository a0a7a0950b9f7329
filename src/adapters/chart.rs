//! Chart rendering: assembled values in, named manifest artifacts out

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

use crate::adapters::values::Values;
use crate::adapters::{configmap_builder, service_builder, statefulset_builder};
use crate::crd;
use crate::{Error, Result};

/// Artifact path of the rendered Service manifest
pub const SERVICE_CHART_PATH: &str = "etcd/templates/etcd-service.yaml";
/// Artifact path of the rendered ConfigMap manifest
pub const CONFIGMAP_CHART_PATH: &str = "etcd/templates/etcd-configmap.yaml";
/// Artifact path of the rendered StatefulSet manifest
pub const STATEFULSET_CHART_PATH: &str = "etcd/templates/etcd-statefulset.yaml";

/// A rendered chart: manifest text keyed by artifact path
#[derive(Clone, Debug)]
pub struct RenderedChart {
    files: BTreeMap<String, String>,
}

impl RenderedChart {
    /// Rendered artifacts keyed by path
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    /// Decode the Service artifact; missing artifact is a fatal render error.
    pub fn service(&self) -> Result<Service> {
        self.decode(SERVICE_CHART_PATH)
    }

    /// Decode the ConfigMap artifact; missing artifact is a fatal render error.
    pub fn config_map(&self) -> Result<ConfigMap> {
        self.decode(CONFIGMAP_CHART_PATH)
    }

    /// Decode the StatefulSet artifact; missing artifact is a fatal render error.
    pub fn statefulset(&self) -> Result<StatefulSet> {
        self.decode(STATEFULSET_CHART_PATH)
    }

    fn decode<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let text = self.files.get(path).ok_or_else(|| {
            Error::RenderError(format!("missing template file in the chart: {}", path))
        })?;
        serde_yaml::from_str(text)
            .map_err(|e| Error::RenderError(format!("cannot decode {}: {}", path, e)))
    }
}

/// Render all three child manifests from the assembled values.
pub fn render(values: &Values) -> Result<RenderedChart> {
    let mut files = BTreeMap::new();
    files.insert(
        SERVICE_CHART_PATH.to_string(),
        to_yaml(&service_builder::build_service(values))?,
    );
    files.insert(
        CONFIGMAP_CHART_PATH.to_string(),
        to_yaml(&configmap_builder::build_config_map(values)?)?,
    );
    files.insert(
        STATEFULSET_CHART_PATH.to_string(),
        to_yaml(&statefulset_builder::build_statefulset(values)?)?,
    );
    Ok(RenderedChart { files })
}

/// Render only the StatefulSet manifest. Used after the claimed service and
/// config-map names have been folded back into the values.
pub fn render_statefulset(values: &Values) -> Result<StatefulSet> {
    statefulset_builder::build_statefulset(values)
}

/// Controller owner reference for children rendered from these values.
pub fn owner_reference(values: &Values) -> OwnerReference {
    OwnerReference {
        api_version: crd::API_VERSION.to_string(),
        kind: crd::KIND.to_string(),
        name: values.name.clone(),
        uid: values.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn to_yaml<T: serde::Serialize>(manifest: &T) -> Result<String> {
    serde_yaml::to_string(manifest)
        .map_err(|e| Error::RenderError(format!("cannot serialize manifest: {}", e)))
}
