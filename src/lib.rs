use std::time::Duration;

use thiserror::Error;

/// Expose all controller components used by main
pub mod operator;
pub mod resources;

/// Desired-state diffing and application of owned objects
pub mod apply;
pub mod config;
pub mod etcd;
pub mod installer;
pub mod names;
pub mod reconcilers;
pub mod store;
pub mod triggers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("{kind} is missing {field}")]
    MissingObjectKey {
        kind: &'static str,
        field: &'static str,
    },

    #[error("Conflict updating {kind} {key}: object was modified")]
    Conflict { kind: String, key: String },

    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("Token for service account {0} has not been populated yet")]
    TokenPending(String),

    #[error("Invalid kubeconfig for cluster {cluster}: {reason}")]
    Kubeconfig { cluster: String, reason: String },

    #[error("Timed out querying etcd membership for node {0}")]
    EtcdTimeout(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Removal deferred for {0:?}")]
    RemovalDeferred(Duration),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::SerializationError(_) => "serializationerror".into(),
            Error::KubeError(_) => "kubeerror".into(),
            Error::FinalizerError(_) => "finalizererror".into(),
            Error::MissingObjectKey { .. } => "missingobjectkey".into(),
            Error::Conflict { .. } => "conflict".into(),
            Error::NotFound { .. } => "notfound".into(),
            Error::TokenPending(_) => "tokenpending".into(),
            Error::Kubeconfig { .. } => "kubeconfig".into(),
            Error::EtcdTimeout(_) => "etcdtimeout".into(),
            Error::Config(_) => "config".into(),
            Error::RemovalDeferred(_) => "removaldeferred".into(),
        }
    }

    /// The retry delay when this error only postpones a removal.
    pub fn deferred_for(&self) -> Option<Duration> {
        match self {
            Error::RemovalDeferred(delay) => Some(*delay),
            Error::FinalizerError(inner) => match inner.as_ref() {
                kube::runtime::finalizer::Error::CleanupFailed(e) => e.deferred_for(),
                _ => None,
            },
            _ => None,
        }
    }
}
