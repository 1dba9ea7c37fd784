use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{non_empty, CAPI_CLUSTER_LABEL, CAPI_PAUSED_ANNOTATION, FORCE_REMOVE_ETCD_ANNOTATION};

/// Bootstrap configuration for a single Cluster API machine.
///
/// One `RKEBootstrap` exists per machine. The operator generates the plan and
/// bootstrap credentials for it and holds back its deletion while the machine
/// is an etcd member that cannot yet be removed.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "RKEBootstrap",
    group = "rke.cattle.io",
    version = "v1",
    status = "RKEBootstrapStatus",
    doc = "Bootstrap configuration for a machine joining an RKE cluster",
    namespaced,
    printcolumn = r#"{ "name": "cluster", "type": "string", "description": "owning cluster", "jsonPath": ".spec.clusterName" }"#,
    printcolumn = r#"{ "name": "ready", "type": "boolean", "description": "bootstrap data available", "jsonPath": ".status.ready" }"#,
    printcolumn = r#"{ "name": "secret", "type": "string", "description": "bootstrap data secret", "jsonPath": ".status.dataSecretName" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct RKEBootstrapSpec {
    /// Name of the owning cluster. Set once and never changed.
    #[serde(default)]
    pub cluster_name: String,
}

/// The status of a bootstrap.
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RKEBootstrapStatus {
    /// Secret holding the install payload. Assigned once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,

    /// Whether bootstrap data is available for the machine.
    #[serde(default)]
    pub ready: bool,
}

impl RKEBootstrap {
    /// Cluster name from the Cluster API cluster label, if any.
    pub fn cluster_label(&self) -> Option<&str> {
        non_empty(self.labels(), CAPI_CLUSTER_LABEL)
    }

    pub fn is_paused(&self) -> bool {
        self.annotations().contains_key(CAPI_PAUSED_ANNOTATION)
    }

    pub fn force_remove(&self) -> bool {
        self.annotations()
            .get(FORCE_REMOVE_ETCD_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}
