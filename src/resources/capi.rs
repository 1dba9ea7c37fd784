//! The subset of the Cluster API `Machine` and `Cluster` resources consumed here.
//!
//! These are never written wholesale; updates go through merge patches so fields
//! not modelled here survive.

use std::str::FromStr;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ETCD_ROLE_LABEL, PRE_TERMINATE_ANNOTATION, PRE_TERMINATE_OWNER};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Machine",
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub bootstrap: MachineBootstrap,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// The node this machine joined as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,
}

/// Lifecycle phases reported by Cluster API
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachinePhase {
    Pending,
    Provisioning,
    Provisioned,
    Running,
    Deleting,
    Deleted,
    Failed,
    Unknown,
}

impl FromStr for MachinePhase {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Pending" => Self::Pending,
            "Provisioning" => Self::Provisioning,
            "Provisioned" => Self::Provisioned,
            "Running" => Self::Running,
            "Deleting" => Self::Deleting,
            "Deleted" => Self::Deleted,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        })
    }
}

impl MachinePhase {
    /// Whether a machine in this phase may still need its install payload.
    pub fn needs_bootstrap(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Deleting | Self::Failed | Self::Provisioning
        )
    }
}

impl Machine {
    pub fn phase(&self) -> MachinePhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|p| p.parse().unwrap_or(MachinePhase::Unknown))
            .unwrap_or(MachinePhase::Unknown)
    }

    /// Any value of the etcd role label makes the machine an etcd member.
    pub fn is_etcd(&self) -> bool {
        self.labels().contains_key(ETCD_ROLE_LABEL)
    }

    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .and_then(|r| r.name.as_deref())
    }

    pub fn has_pre_terminate_hook(&self) -> bool {
        self.annotations().contains_key(PRE_TERMINATE_ANNOTATION)
    }

    /// The hook is present and carries our owner value.
    pub fn owns_pre_terminate_hook(&self) -> bool {
        self.annotations().get(PRE_TERMINATE_ANNOTATION).map(String::as_str)
            == Some(PRE_TERMINATE_OWNER)
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "Cluster",
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub paused: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub infrastructure_ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl Cluster {
    pub fn infrastructure_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.infrastructure_ready)
    }
}
