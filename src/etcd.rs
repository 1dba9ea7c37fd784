//! Queries against the etcd membership of a downstream cluster.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info};

use crate::{Error, Result};

/// Kubernetes distribution running the downstream cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Runtime {
    Rke2,
    K3s,
}

impl Runtime {
    pub fn from_kubernetes_version(version: &str) -> Self {
        if version.contains("k3s") {
            Self::K3s
        } else {
            Self::Rke2
        }
    }

    /// Annotation asking the runtime to remove the node's etcd member.
    pub fn remove_annotation(self) -> String {
        format!("etcd.{self}.cattle.io/remove")
    }

    /// Annotation the runtime sets once the member is gone.
    pub fn removed_node_name_annotation(self) -> String {
        format!("etcd.{self}.cattle.io/removed-node-name")
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rke2 => write!(f, "rke2"),
            Self::K3s => write!(f, "k3s"),
        }
    }
}

/// Decides whether the etcd member behind a node can go away without breaking quorum
#[async_trait]
pub trait EtcdMembership: Send + Sync {
    /// `Ok(false)` means "not yet", the caller should ask again later.
    async fn safely_removed(
        &self,
        cluster: &str,
        kubeconfig: &[u8],
        runtime: Runtime,
        node_name: &str,
    ) -> Result<bool>;
}

/// Asks the runtime on the downstream cluster to remove the member through node
/// annotations and reports removal once the runtime confirms it.
#[derive(Clone, Debug)]
pub struct NodeAnnotationProbe {
    timeout: Duration,
}

impl NodeAnnotationProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn client(cluster: &str, kubeconfig: &[u8]) -> Result<Client> {
        let invalid = |reason: String| Error::Kubeconfig {
            cluster: cluster.to_string(),
            reason,
        };
        let raw = std::str::from_utf8(kubeconfig).map_err(|e| invalid(e.to_string()))?;
        let kubeconfig = Kubeconfig::from_yaml(raw).map_err(|e| invalid(e.to_string()))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| invalid(e.to_string()))?;
        Client::try_from(config).map_err(|e| invalid(e.to_string()))
    }

    async fn query(
        &self,
        cluster: &str,
        kubeconfig: &[u8],
        runtime: Runtime,
        node_name: &str,
    ) -> Result<bool> {
        let nodes: Api<Node> = Api::all(Self::client(cluster, kubeconfig).await?);
        let Some(node) = nodes.get_opt(node_name).await? else {
            debug!(cluster, node = node_name, "node is gone, etcd member removed");
            return Ok(true);
        };

        let remove = runtime.remove_annotation();
        match removal_state(node.annotations(), runtime) {
            RemovalState::Removed => Ok(true),
            RemovalState::Requested => Ok(false),
            RemovalState::NotRequested => {
                info!(cluster, node = node_name, "requesting etcd member removal");
                let patch = json!({
                    "metadata": {
                        "resourceVersion": node.resource_version(),
                        "annotations": { remove: "true" },
                    }
                });
                nodes
                    .patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(false)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RemovalState {
    NotRequested,
    Requested,
    Removed,
}

fn removal_state(
    annotations: &std::collections::BTreeMap<String, String>,
    runtime: Runtime,
) -> RemovalState {
    let requested = annotations
        .get(&runtime.remove_annotation())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let removed = annotations
        .get(&runtime.removed_node_name_annotation())
        .is_some_and(|v| !v.is_empty());
    match (requested, removed) {
        (false, _) => RemovalState::NotRequested,
        (true, false) => RemovalState::Requested,
        (true, true) => RemovalState::Removed,
    }
}

#[async_trait]
impl EtcdMembership for NodeAnnotationProbe {
    async fn safely_removed(
        &self,
        cluster: &str,
        kubeconfig: &[u8],
        runtime: Runtime,
        node_name: &str,
    ) -> Result<bool> {
        tokio::time::timeout(self.timeout, self.query(cluster, kubeconfig, runtime, node_name))
            .await
            .map_err(|_| Error::EtcdTimeout(node_name.to_string()))?
    }
}
