use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-wide control plane configuration, read by the bootstrap operator.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    kind = "RKEControlPlane",
    group = "rke.cattle.io",
    version = "v1",
    doc = "Control plane configuration of an RKE cluster",
    namespaced,
    printcolumn = r#"{ "name": "version", "type": "string", "description": "kubernetes version", "jsonPath": ".spec.kubernetesVersion" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct RKEControlPlaneSpec {
    /// Kubernetes version of the cluster, e.g. `v1.27.4+rke2r1`.
    #[serde(default)]
    pub kubernetes_version: String,

    /// Extra environment variables handed to every node agent.
    #[serde(default)]
    pub agent_env_vars: Vec<EnvVar>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}
