//! Access to the shared object store.
//!
//! Reconcilers never talk to the API server directly. They are handed a
//! [`Store`], which is backed by the cluster in production ([`KubeStore`]) and by
//! an in-process arena in tests ([`MemoryStore`]). Every read of a missing object
//! is `Ok(None)`; every conditional write that loses a race is
//! [`Error::Conflict`](crate::Error::Conflict).

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use crate::{Error, Result};

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, ObjectKey};

/// Any namespaced resource the operator reads or writes
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Lookup and write capability over namespaced objects
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Fetch an object, `None` if it does not exist.
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// All objects in a namespace carrying every one of the given labels.
    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;

    async fn create<K: Managed>(&self, obj: &K) -> Result<K>;

    /// Replace an object, guarded by its resource version.
    async fn replace<K: Managed>(&self, obj: &K) -> Result<K>;

    /// Delete an object. Deleting something already gone is not an error.
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Apply a JSON merge patch to an object.
    ///
    /// A `metadata.resourceVersion` inside the patch acts as a precondition.
    async fn merge_patch<K: Managed>(&self, obj: &K, patch: Value) -> Result<K>;

    /// Apply a JSON merge patch to the status subresource of an object.
    async fn merge_patch_status<K: Managed>(&self, obj: &K, patch: Value) -> Result<K>;
}

/// Namespace and name of an object, both required.
pub fn locate<K: Resource>(obj: &K) -> Result<(String, String)> {
    let namespace = obj.meta().namespace.clone().ok_or(Error::MissingObjectKey {
        kind: "object",
        field: "namespace",
    })?;
    let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey {
        kind: "object",
        field: "name",
    })?;
    Ok((namespace, name))
}

/// Merge patch setting (or with `None`, removing) one annotation, conditional on
/// the resource version the caller last saw.
pub fn annotation_patch<K: ResourceExt>(obj: &K, key: &str, value: Option<&str>) -> Value {
    json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "annotations": { key: value },
        }
    })
}

/// Apply an RFC 7386 merge patch to a JSON document.
pub(crate) fn json_merge(target: &mut Value, patch: &Value) {
    let Value::Object(changes) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(fields) = target {
        for (key, value) in changes {
            if value.is_null() {
                fields.remove(key);
            } else {
                json_merge(fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_patch_semantics() {
        let mut doc = json!({
            "metadata": { "name": "m", "annotations": { "a": "1", "b": "2" } },
            "spec": { "list": [1, 2] }
        });
        json_merge(
            &mut doc,
            &json!({ "metadata": { "annotations": { "a": null, "c": "3" } }, "spec": { "list": [3] } }),
        );
        assert_eq!(
            doc,
            json!({
                "metadata": { "name": "m", "annotations": { "b": "2", "c": "3" } },
                "spec": { "list": [3] }
            })
        );
    }

    #[test]
    fn merge_patch_creates_missing_maps() {
        let mut doc = json!({ "metadata": { "name": "m" } });
        json_merge(&mut doc, &json!({ "metadata": { "annotations": { "k": "v" } } }));
        assert_eq!(doc["metadata"]["annotations"]["k"], "v");
    }
}
