//! Client Service manifest for an etcd instance

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::adapters::chart::owner_reference;
use crate::adapters::values::Values;

/// Build the client Service exposing the etcd client and sidecar ports.
pub fn build_service(values: &Values) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(values.service_name.clone()),
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
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(values.labels.clone()),
            ports: Some(vec![
                ServicePort {
                    name: Some("client".to_string()),
                    port: values.etcd.client_port,
                    target_port: Some(IntOrString::String("client".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("backuprestore".to_string()),
                    port: values.backup.port,
                    target_port: Some(IntOrString::String("backuprestore".to_string())),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
