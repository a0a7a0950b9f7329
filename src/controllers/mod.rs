//! Controller implementations for watching and reconciling resources

pub mod custodian_controller;
pub mod etcd_controller;

use kube::Client;
use std::sync::Arc;

use crate::adapters::images::ImageVector;

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Image catalog, read once at start-up
    pub image_vector: ImageVector,
    /// Reconcile on any change instead of only on the operation annotation
    pub ignore_operation_annotation: bool,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        image_vector: ImageVector,
        ignore_operation_annotation: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            image_vector,
            ignore_operation_annotation,
        })
    }
}
