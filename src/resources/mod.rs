use std::collections::BTreeMap;

use kube::ResourceExt;

mod bootstrap;
mod capi;
mod control_plane;

pub use bootstrap::*;
pub use capi::*;
pub use control_plane::*;

/// Label naming the `RKEBootstrap` that an object was generated for.
pub const BOOTSTRAP_NAME_LABEL: &str = "rke.cattle.io/rkebootstrap-name";
pub const MACHINE_NAME_LABEL: &str = "rke.cattle.io/machine-name";
pub const CLUSTER_NAME_LABEL: &str = "rke.cattle.io/cluster-name";
pub const PLAN_SECRET_LABEL: &str = "rke.cattle.io/plan-secret-name";
pub const ETCD_ROLE_LABEL: &str = "rke.cattle.io/etcd-role";
pub const OS_LABEL: &str = "cattle.io/os";
pub const WINDOWS_OS: &str = "windows";

/// Role of a generated service account.
pub const ROLE_LABEL: &str = "rke.cattle.io/service-account-role";
pub const ROLE_PLAN: &str = "rke-machine-plan";
pub const ROLE_BOOTSTRAP: &str = "rke-bootstrap";

pub const SECRET_TYPE_MACHINE_PLAN: &str = "rke.cattle.io/machine-plan";
pub const SECRET_TYPE_BOOTSTRAP: &str = "rke.cattle.io/bootstrap";
pub const SECRET_TYPE_SERVICE_ACCOUNT_TOKEN: &str = "kubernetes.io/service-account-token";
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Operator escape hatch skipping the etcd safety check on removal.
pub const FORCE_REMOVE_ETCD_ANNOTATION: &str = "rke.cattle.io/force-remove";

/// Cluster API conventions
pub const CAPI_CLUSTER_LABEL: &str = "cluster.x-k8s.io/cluster-name";
pub const CAPI_PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// Hook annotation holding back infrastructure teardown of a machine.
pub const PRE_TERMINATE_ANNOTATION: &str =
    "pre-terminate.delete.hook.machine.cluster.x-k8s.io/rke-bootstrap-cleanup";
pub const PRE_TERMINATE_OWNER: &str = "rke-bootstrap-controller";

macro_rules! meta {
    (owners: $owners:expr) => {{
        ::kube::core::ObjectMeta {
            owner_references: Some($owners),

            ..Default::default()
        }
    }};

    (owners: $owners:expr, $($lhs:ident : $rhs:expr),* $(,)?) => {{
        ::kube::core::ObjectMeta {
            owner_references: Some($owners),
            $($lhs : $rhs),*,

            ..Default::default()
        }
    }};
}
pub(crate) use meta;

macro_rules! labels {
    ($($key:expr => $value:expr),* $(,)?) => {{
        ::std::collections::BTreeMap::<String, String>::from_iter([
            $(($key.to_string(), $value.to_string())),*
        ])
    }};
}
pub(crate) use labels;

/// `namespace/name` of any namespaced object, for logs.
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Whether the object has been marked for deletion.
pub fn is_deleting<K: ResourceExt>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Look up a label, treating empty values as absent.
pub(crate) fn non_empty<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key).map(String::as_str).filter(|v| !v.is_empty())
}
