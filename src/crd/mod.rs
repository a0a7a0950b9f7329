//! Custom Resource Definitions for the etcd druid operator

mod etcd;

pub use etcd::*;

use kube::CustomResourceExt;

/// Generate CRD YAML manifests for all custom resources
pub fn generate_crds() -> Vec<String> {
    vec![serde_yaml::to_string(&Etcd::crd()).unwrap()]
}
