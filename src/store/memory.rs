use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::{json_merge, locate, Managed, Store};
use crate::{Error, Result};

/// Identity of an object in the arena
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    fn of<K: Managed>(namespace: &str, name: &str) -> Self {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn describe(&self) -> (String, String) {
        (self.kind.clone(), format!("{}/{}", self.namespace, self.name))
    }
}

#[derive(Default)]
struct Arena {
    objects: BTreeMap<ObjectKey, Value>,
    /// owner uid -> objects naming it in their owner references
    dependents: HashMap<String, BTreeSet<ObjectKey>>,
    revision: u64,
    writes: usize,
}

/// An in-process [`Store`].
///
/// Objects live as JSON in an arena. The store hands out uids and resource
/// versions, rejects writes carrying a stale resource version, and follows owner
/// references on delete the way the garbage collector would.
#[derive(Clone, Default)]
pub struct MemoryStore {
    arena: Arc<Mutex<Arena>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object without counting it as a write.
    pub fn insert<K: Managed>(&self, obj: K) -> Result<K> {
        let (namespace, name) = locate(&obj)?;
        let key = ObjectKey::of::<K>(&namespace, &name);
        let mut arena = self.lock();
        let mut value = serde_json::to_value(&obj)?;
        arena.stamp(&mut value, true);
        arena.store(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Number of writes performed through the [`Store`] interface.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Every object of a kind, across namespaces.
    pub fn all<K: Managed>(&self) -> Result<Vec<K>> {
        let template = ObjectKey::of::<K>("", "");
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| k.api_version == template.api_version && k.kind == template.kind)
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    /// Objects whose owner references name the given uid.
    pub fn dependents_of(&self, owner_uid: &str) -> Vec<ObjectKey> {
        self.lock()
            .dependents
            .get(owner_uid)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Arena {
    /// Bump the revision and stamp it (and a uid on creation) into the object.
    fn stamp(&mut self, value: &mut Value, create: bool) {
        self.revision += 1;
        let revision = self.revision.to_string();
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".into(), revision.into());
            if create && !meta.contains_key("uid") {
                meta.insert("uid".into(), Uuid::new_v4().to_string().into());
            }
        }
    }

    fn store(&mut self, key: ObjectKey, value: Value) {
        for keys in self.dependents.values_mut() {
            keys.remove(&key);
        }
        let owners = value
            .pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|r| r.get("uid").and_then(Value::as_str));
        for uid in owners {
            self.dependents
                .entry(uid.to_string())
                .or_default()
                .insert(key.clone());
        }
        self.objects.insert(key, value);
    }

    fn remove(&mut self, key: &ObjectKey) {
        let Some(value) = self.objects.remove(key) else {
            return;
        };
        for keys in self.dependents.values_mut() {
            keys.remove(key);
        }
        let uid = value.pointer("/metadata/uid").and_then(Value::as_str);
        if let Some(children) = uid.and_then(|uid| self.dependents.remove(uid)) {
            for child in children {
                self.remove(&child);
            }
        }
    }

    fn existing(&self, key: &ObjectKey) -> Result<&Value> {
        self.objects.get(key).ok_or_else(|| {
            let (kind, key) = key.describe();
            Error::NotFound { kind, key }
        })
    }

    /// Fail with a conflict unless `expected` is absent or matches the stored version.
    fn check_version(&self, key: &ObjectKey, expected: Option<&str>) -> Result<()> {
        let current = self
            .existing(key)?
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        match expected {
            Some(v) if Some(v) != current => {
                let (kind, key) = key.describe();
                Err(Error::Conflict { kind, key })
            }
            _ => Ok(()),
        }
    }

    fn patch(&mut self, key: ObjectKey, mut patch: Value, status_only: bool) -> Result<Value> {
        let expected = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.check_version(&key, expected.as_deref())?;
        if let Some(meta) = patch.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("resourceVersion");
        }

        let mut value = self.existing(&key)?.clone();
        if status_only {
            let status = patch.get("status").cloned().unwrap_or(Value::Null);
            json_merge(&mut value, &serde_json::json!({ "status": status }));
        } else {
            // the status subresource is not writable through the main resource
            if let Some(fields) = patch.as_object_mut() {
                fields.remove("status");
            }
            json_merge(&mut value, &patch);
        }
        self.stamp(&mut value, false);
        self.writes += 1;
        self.store(key, value.clone());
        Ok(value)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let key = ObjectKey::of::<K>(namespace, name);
        match self.lock().objects.get(&key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let template = ObjectKey::of::<K>(namespace, "");
        let arena = self.lock();
        arena
            .objects
            .iter()
            .filter(|(k, _)| {
                k.api_version == template.api_version
                    && k.kind == template.kind
                    && k.namespace == template.namespace
            })
            .filter(|(_, v)| {
                labels.iter().all(|(label, expected)| {
                    v.pointer("/metadata/labels")
                        .and_then(|l| l.get(label))
                        .and_then(Value::as_str)
                        == Some(expected.as_str())
                })
            })
            .map(|(_, v)| Ok(serde_json::from_value(v.clone())?))
            .collect()
    }

    async fn create<K: Managed>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        let key = ObjectKey::of::<K>(&namespace, &name);
        let mut arena = self.lock();
        if arena.objects.contains_key(&key) {
            let (kind, key) = key.describe();
            return Err(Error::Conflict { kind, key });
        }
        let mut value = serde_json::to_value(obj)?;
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("uid");
        }
        arena.stamp(&mut value, true);
        arena.writes += 1;
        arena.store(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        let key = ObjectKey::of::<K>(&namespace, &name);
        let mut arena = self.lock();
        arena.check_version(&key, obj.meta().resource_version.as_deref())?;
        let uid = arena.existing(&key)?.pointer("/metadata/uid").cloned();

        let mut value = serde_json::to_value(obj)?;
        if let (Some(meta), Some(uid)) = (
            value.get_mut("metadata").and_then(Value::as_object_mut),
            uid,
        ) {
            meta.insert("uid".into(), uid);
        }
        arena.stamp(&mut value, false);
        arena.writes += 1;
        arena.store(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut arena = self.lock();
        if arena.objects.contains_key(&key) {
            arena.writes += 1;
            arena.remove(&key);
        }
        Ok(())
    }

    async fn merge_patch<K: Managed>(&self, obj: &K, patch: Value) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        let key = ObjectKey::of::<K>(&namespace, &name);
        let value = self.lock().patch(key, patch, false)?;
        Ok(serde_json::from_value(value)?)
    }

    async fn merge_patch_status<K: Managed>(&self, obj: &K, patch: Value) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        let key = ObjectKey::of::<K>(&namespace, &name);
        let value = self.lock().patch(key, patch, true)?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
    use kube::{Resource, ResourceExt};
    use serde_json::json;

    use super::*;
    use crate::store::annotation_patch;

    fn secret(name: &str) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.into());
        secret.metadata.namespace = Some("ns".into());
        secret
    }

    #[tokio::test]
    async fn create_assigns_identity() {
        let store = MemoryStore::new();
        let created = store.create(&secret("a")).await.unwrap();
        assert!(created.uid().is_some());
        assert!(created.resource_version().is_some());
        assert!(store.create(&secret("a")).await.is_err());
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = MemoryStore::new();
        let first = store.create(&secret("a")).await.unwrap();
        let second = store
            .merge_patch(&first, annotation_patch(&first, "k", Some("v")))
            .await
            .unwrap();
        assert_eq!(second.annotations()["k"], "v");

        // first still carries the old resource version
        let err = store
            .merge_patch(&first, annotation_patch(&first, "k", None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(matches!(store.replace(&first).await, Err(Error::Conflict { .. })));

        let removed = store
            .merge_patch(&second, annotation_patch(&second, "k", None))
            .await
            .unwrap();
        assert!(!removed.annotations().contains_key("k"));
    }

    #[tokio::test]
    async fn delete_cascades_through_owner_references() {
        let store = MemoryStore::new();
        let mut owner = ServiceAccount::default();
        owner.metadata.name = Some("sa".into());
        owner.metadata.namespace = Some("ns".into());
        let owner = store.create(&owner).await.unwrap();

        let mut child = secret("sa-token");
        child.metadata.owner_references = Some(vec![owner.controller_owner_ref(&()).unwrap()]);
        store.create(&child).await.unwrap();
        store.create(&secret("unrelated")).await.unwrap();
        assert_eq!(store.dependents_of(&owner.uid().unwrap()).len(), 1);

        store.delete::<ServiceAccount>("ns", "sa").await.unwrap();
        assert!(store.get::<Secret>("ns", "sa-token").await.unwrap().is_none());
        assert!(store.get::<Secret>("ns", "unrelated").await.unwrap().is_some());
        // deleting twice is fine
        store.delete::<ServiceAccount>("ns", "sa").await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_labels_and_namespace() {
        let store = MemoryStore::new();
        let mut labelled = secret("a");
        labelled.metadata.labels = Some(BTreeMap::from([("app".into(), "x".into())]));
        store.insert(labelled).unwrap();
        store.insert(secret("b")).unwrap();
        let mut elsewhere = secret("c");
        elsewhere.metadata.namespace = Some("other".into());
        store.insert(elsewhere).unwrap();

        let all: Vec<Secret> = store.list("ns", &BTreeMap::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        let selected: Vec<Secret> = store
            .list("ns", &BTreeMap::from([("app".to_string(), "x".to_string())]))
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name_any(), "a");
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn status_patch_only_touches_status() {
        let store = MemoryStore::new();
        let created = store.create(&secret("a")).await.unwrap();
        let patched = store
            .merge_patch_status(
                &created,
                json!({ "metadata": { "labels": { "x": "y" } }, "status": null }),
            )
            .await
            .unwrap();
        assert!(patched.metadata.labels.is_none());
    }
}
