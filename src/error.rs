//! Error types for the etcd druid operator

use std::fmt;

/// Result type for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the operator
#[derive(Debug)]
pub enum Error {
    /// Kubernetes API error
    KubeError(String),
    /// Chart render error (missing artifact, undecodable manifest)
    RenderError(String),
    /// Image could not be resolved from the spec or the image vector
    ImageError(String),
    /// Referenced secret missing or not pinnable
    SecretError(String),
    /// Invalid Etcd spec (selector, replicas)
    ValidationError(String),
    /// The workload did not become ready within the wait budget
    NotReady(String),
    /// Adoption refused or claim lost to another controller
    OwnershipError(String),
    /// Finalizer error
    FinalizerError(Box<kube::runtime::finalizer::Error<Error>>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KubeError(msg) => write!(f, "Kubernetes API error: {}", msg),
            Error::RenderError(msg) => write!(f, "Render error: {}", msg),
            Error::ImageError(msg) => write!(f, "Image error: {}", msg),
            Error::SecretError(msg) => write!(f, "Secret error: {}", msg),
            Error::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Error::NotReady(msg) => write!(f, "Not ready: {}", msg),
            Error::OwnershipError(msg) => write!(f, "Ownership error: {}", msg),
            Error::FinalizerError(e) => write!(f, "Finalizer error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::KubeError(err.to_string())
    }
}

/// True for an API `NotFound` response.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True for an optimistic-concurrency conflict.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// True when the server rejected the write because a precondition no longer
/// holds; the caller already has the desired state in that case.
pub fn is_precondition_violated(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => {
            resp.code == 412 || resp.message.to_lowercase().contains("precondition")
        }
        _ => false,
    }
}
