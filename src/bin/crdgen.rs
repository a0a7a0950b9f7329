//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the Etcd custom
//! resource.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use etcd_druid_operator::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
