use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    config::Settings, etcd::EtcdMembership, installer::InstallScripts, operator::Diagnostics,
    Metrics, Result,
};

pub mod artifacts;
pub mod bootstrap;
pub mod readiness;
pub mod removal;

/// How long to wait before looking again at a bootstrap whose dependencies are not ready.
pub const READINESS_REQUEUE: Duration = Duration::from_secs(10);

/// How long to wait before asking again whether an etcd member may be removed.
pub const ETCD_REMOVAL_REQUEUE: Duration = Duration::from_secs(5);

/// The context passed around
pub struct Context<S> {
    /// Object store holding every resource the operator reads or writes
    pub store: S,

    /// Etcd membership queries against downstream clusters
    pub etcd: Arc<dyn EtcdMembership>,

    /// Install script generation
    pub installer: Arc<dyn InstallScripts>,

    pub settings: Settings,

    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,

    /// Prometheus metrics
    pub metrics: Metrics,
}

/// Result of a reconciliation pass that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The pass completed. On removal this allows the deletion to finish.
    Applied,

    /// Nothing was changed this pass; look again after the delay.
    Skip { retry_after: Duration },
}

impl Outcome {
    pub fn skip(retry_after: Duration) -> Self {
        Self::Skip { retry_after }
    }
}

/// A resource that can be reconciled by a controller
#[async_trait]
pub trait Reconcile<C: Send + Sync> {
    /// Bring everything derived from this resource in line with it
    async fn reconcile(&self, context: Arc<C>) -> Result<Outcome>;

    /// Decide whether this resource may finish deleting, releasing what it holds
    async fn cleanup(&self, context: Arc<C>) -> Result<Outcome>;
}
