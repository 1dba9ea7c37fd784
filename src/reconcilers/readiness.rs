//! Preconditions checked before anything is generated for a bootstrap.

use kube::ResourceExt;
use tracing::debug;

use crate::{
    resources::{object_key, Cluster, Machine, RKEBootstrap, CAPI_GROUP},
    store::Store,
    Metrics, Result,
};

/// Why a bootstrap cannot be worked on yet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// No Machine owns the bootstrap yet
    NoMachine,
    ClusterMissing,
    Paused,
    InfrastructureNotReady,
}

impl WaitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoMachine => "no_machine",
            Self::ClusterMissing => "cluster_missing",
            Self::Paused => "paused",
            Self::InfrastructureNotReady => "infrastructure_not_ready",
        }
    }
}

pub enum Readiness {
    Ready { machine: Machine, cluster: Cluster },
    Waiting(WaitReason),
}

/// The Machine named as owner of the bootstrap, if it exists.
pub async fn owner_machine<S: Store>(store: &S, bootstrap: &RKEBootstrap) -> Result<Option<Machine>> {
    let owner = bootstrap.owner_references().iter().find(|o| {
        o.kind == "Machine" && o.api_version.split('/').next() == Some(CAPI_GROUP)
    });
    let (Some(owner), Some(namespace)) = (owner, bootstrap.namespace()) else {
        return Ok(None);
    };
    store.get(&namespace, &owner.name).await
}

/// Resolve the machine and cluster a bootstrap belongs to, or say why not.
pub async fn evaluate<S: Store>(
    store: &S,
    bootstrap: &RKEBootstrap,
    metrics: &Metrics,
) -> Result<Readiness> {
    let key = object_key(bootstrap);
    let waiting = |reason: WaitReason| {
        metrics.deferred(reason.as_str());
        Ok(Readiness::Waiting(reason))
    };

    let Some(machine) = owner_machine(store, bootstrap).await? else {
        debug!(bootstrap = %key, "waiting for machine to be set as owner reference");
        return waiting(WaitReason::NoMachine);
    };

    let cluster = match machine.namespace() {
        Some(namespace) if !machine.spec.cluster_name.is_empty() => {
            store.get::<Cluster>(&namespace, &machine.spec.cluster_name).await?
        }
        _ => None,
    };
    let Some(cluster) = cluster else {
        debug!(bootstrap = %key, cluster = %machine.spec.cluster_name, "waiting for cluster to be available");
        return waiting(WaitReason::ClusterMissing);
    };

    if cluster.spec.paused || bootstrap.is_paused() {
        debug!(bootstrap = %key, cluster = %cluster.name_any(), "reconciliation is paused");
        return waiting(WaitReason::Paused);
    }

    if !cluster.infrastructure_ready() {
        debug!(bootstrap = %key, cluster = %cluster.name_any(), "waiting for cluster infrastructure to be ready");
        return waiting(WaitReason::InfrastructureNotReady);
    }

    Ok(Readiness::Ready { machine, cluster })
}
