//! Applying the objects generated for a bootstrap.
//!
//! The reconciler returns the complete set of objects that should exist for a
//! bootstrap. [`apply`] compares it with what the store holds for that bootstrap,
//! creates what is missing, updates what drifted, and deletes what is no longer
//! wanted. Live fields this operator does not manage are left alone.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::{
    api::{
        core::v1::{Secret, ServiceAccount},
        rbac::v1::{Role, RoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use kube::{Resource, ResourceExt};
use tracing::debug;

use crate::{
    resources::{object_key, BOOTSTRAP_NAME_LABEL},
    store::{Managed, Store},
    Error, Result,
};

/// Reconcile a live object towards a desired one
pub trait Converge: Managed {
    /// Fold the managed parts of `desired` into `live`, reporting whether anything changed.
    fn converge(desired: &Self, live: &mut Self) -> bool;
}

/// One step needed to move live state towards desired state
#[derive(Debug, PartialEq)]
pub enum Change<K> {
    Create(K),
    Update(K),
    Delete(String),
}

/// Work out the changes turning `live` into `desired`, matching objects by name.
pub fn plan_changes<K: Converge>(desired: Vec<K>, live: Vec<K>) -> Vec<Change<K>> {
    let wanted: BTreeSet<String> = desired.iter().map(|d| d.name_any()).collect();
    let mut live: BTreeMap<String, K> = live.into_iter().map(|l| (l.name_any(), l)).collect();

    let mut changes = Vec::new();
    for object in desired {
        match live.remove(&object.name_any()) {
            None => changes.push(Change::Create(object)),
            Some(mut current) => {
                if K::converge(&object, &mut current) {
                    changes.push(Change::Update(current));
                }
            }
        }
    }
    changes.extend(
        live.into_keys()
            .filter(|name| !wanted.contains(name))
            .map(Change::Delete),
    );
    changes
}

/// Objects that should exist for one bootstrap
#[derive(Clone, Debug, Default)]
pub struct DesiredSet {
    pub service_accounts: Vec<ServiceAccount>,
    pub secrets: Vec<Secret>,
    pub roles: Vec<Role>,
    pub role_bindings: Vec<RoleBinding>,
}

impl DesiredSet {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.service_accounts.len() + self.secrets.len() + self.roles.len() + self.role_bindings.len()
    }

    /// Names of every object in the set, prefixed by kind, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .service_accounts
            .iter()
            .map(|o| format!("ServiceAccount/{}", o.name_any()))
            .chain(self.secrets.iter().map(|o| format!("Secret/{}", o.name_any())))
            .chain(self.roles.iter().map(|o| format!("Role/{}", o.name_any())))
            .chain(self.role_bindings.iter().map(|o| format!("RoleBinding/{}", o.name_any())))
            .collect();
        names.sort();
        names
    }
}

/// Bring the store in line with `desired` for the objects owned by `owner`.
///
/// Returns the number of writes performed.
pub async fn apply<S, O>(store: &S, owner: &O, desired: DesiredSet) -> Result<usize>
where
    S: Store,
    O: Resource<DynamicType = ()>,
{
    let namespace = owner.meta().namespace.clone().ok_or(Error::MissingObjectKey {
        kind: "owner",
        field: "namespace",
    })?;
    let owner_ref = owner.controller_owner_ref(&()).ok_or(Error::MissingObjectKey {
        kind: "owner",
        field: "uid",
    })?;
    let owner_ref = OwnerReference {
        block_owner_deletion: Some(true),
        ..owner_ref
    };
    let selector = BTreeMap::from([(BOOTSTRAP_NAME_LABEL.to_string(), owner.meta().name.clone().unwrap_or_default())]);

    let scope = Scope {
        namespace: &namespace,
        owner: &owner_ref,
        selector: &selector,
    };
    let mut writes = 0;
    writes += apply_kind(store, &scope, desired.service_accounts).await?;
    writes += apply_kind(store, &scope, desired.secrets).await?;
    writes += apply_kind(store, &scope, desired.roles).await?;
    writes += apply_kind(store, &scope, desired.role_bindings).await?;
    Ok(writes)
}

struct Scope<'a> {
    namespace: &'a str,
    owner: &'a OwnerReference,
    selector: &'a BTreeMap<String, String>,
}

async fn apply_kind<S: Store, K: Converge>(store: &S, scope: &Scope<'_>, desired: Vec<K>) -> Result<usize> {
    let desired = desired
        .into_iter()
        .map(|mut object| {
            stamp(object.meta_mut(), scope);
            object
        })
        .collect();
    let live = store
        .list::<K>(scope.namespace, scope.selector)
        .await?
        .into_iter()
        .filter(|l| is_owned_by(l.meta(), scope.owner))
        .collect();

    let changes = plan_changes(desired, live);
    let writes = changes.len();
    for change in changes {
        match change {
            Change::Create(object) => {
                debug!(object = %object_key(&object), kind = %K::kind(&()), "creating");
                store.create(&object).await?;
            }
            Change::Update(object) => {
                debug!(object = %object_key(&object), kind = %K::kind(&()), "updating");
                store.replace(&object).await?;
            }
            Change::Delete(name) => {
                debug!(object = %name, kind = %K::kind(&()), "deleting");
                store.delete::<K>(scope.namespace, &name).await?;
            }
        }
    }
    Ok(writes)
}

/// Namespace, owning label and owner reference every generated object carries
fn stamp(meta: &mut ObjectMeta, scope: &Scope<'_>) {
    meta.namespace = Some(scope.namespace.to_string());
    let labels = meta.labels.get_or_insert_with(Default::default);
    for (k, v) in scope.selector {
        labels.insert(k.clone(), v.clone());
    }
    let owners = meta.owner_references.get_or_insert_with(Vec::new);
    if !owners.iter().any(|o| o.uid == scope.owner.uid) {
        owners.push(scope.owner.clone());
    }
}

fn is_owned_by(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|o| o.uid == owner.uid)
}

/// Merge desired labels, annotations and owner references into live metadata.
fn converge_meta(desired: &ObjectMeta, live: &mut ObjectMeta) -> bool {
    let mut changed = false;
    for (field, live_field) in [
        (&desired.labels, &mut live.labels),
        (&desired.annotations, &mut live.annotations),
    ] {
        for (k, v) in field.iter().flatten() {
            let entries = live_field.get_or_insert_with(Default::default);
            if entries.get(k) != Some(v) {
                entries.insert(k.clone(), v.clone());
                changed = true;
            }
        }
    }
    for owner in desired.owner_references.iter().flatten() {
        let owners = live.owner_references.get_or_insert_with(Vec::new);
        if !owners.iter().any(|o| o == owner) {
            owners.retain(|o| o.uid != owner.uid);
            owners.push(owner.clone());
            changed = true;
        }
    }
    changed
}

fn replace_if_different<T: PartialEq + Clone>(desired: &T, live: &mut T) -> bool {
    if desired == live {
        return false;
    }
    *live = desired.clone();
    true
}

impl Converge for ServiceAccount {
    fn converge(desired: &Self, live: &mut Self) -> bool {
        converge_meta(&desired.metadata, &mut live.metadata)
    }
}

impl Converge for Secret {
    fn converge(desired: &Self, live: &mut Self) -> bool {
        let mut changed = converge_meta(&desired.metadata, &mut live.metadata);
        // secret type is immutable once created
        for (k, v) in desired.data.iter().flatten() {
            let data = live.data.get_or_insert_with(Default::default);
            if data.get(k) != Some(v) {
                data.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        changed
    }
}

impl Converge for Role {
    fn converge(desired: &Self, live: &mut Self) -> bool {
        let meta = converge_meta(&desired.metadata, &mut live.metadata);
        replace_if_different(&desired.rules, &mut live.rules) | meta
    }
}

impl Converge for RoleBinding {
    fn converge(desired: &Self, live: &mut Self) -> bool {
        let meta = converge_meta(&desired.metadata, &mut live.metadata);
        let subjects = replace_if_different(&desired.subjects, &mut live.subjects);
        replace_if_different(&desired.role_ref, &mut live.role_ref) | subjects | meta
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{api::rbac::v1::PolicyRule, ByteString};

    use super::*;
    use crate::{
        resources::{RKEBootstrap, RKEBootstrapSpec},
        store::MemoryStore,
    };

    fn secret(name: &str, data: Option<(&str, &str)>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            data: data.map(|(k, v)| BTreeMap::from([(k.to_string(), ByteString(v.as_bytes().to_vec()))])),
            ..Default::default()
        }
    }

    #[test]
    fn plan_creates_updates_and_deletes() {
        let desired = vec![secret("new", None), secret("drifted", Some(("value", "b")))];
        let live = vec![
            secret("drifted", Some(("value", "a"))),
            secret("stale", None),
        ];
        let changes = plan_changes(desired, live);
        assert_eq!(changes.len(), 3);
        assert!(matches!(&changes[0], Change::Create(s) if s.name_any() == "new"));
        assert!(matches!(&changes[1], Change::Update(s)
            if s.data.as_ref().unwrap()["value"] == ByteString(b"b".to_vec())));
        assert_eq!(changes[2], Change::Delete("stale".into()));
    }

    #[test]
    fn unmanaged_fields_survive() {
        // live plan secret holds a plan written by someone else
        let desired = secret("plan", None);
        let mut live = secret("plan", Some(("plan", "{}")));
        live.metadata.labels = Some(BTreeMap::from([("extra".into(), "x".into())]));
        assert!(!Secret::converge(&desired, &mut live));
        assert!(live.data.is_some());
        assert_eq!(live.metadata.labels.unwrap()["extra"], "x");
    }

    #[test]
    fn role_rules_are_authoritative() {
        let rule = |verb: &str| PolicyRule {
            verbs: vec![verb.into()],
            ..Default::default()
        };
        let desired = Role {
            metadata: ObjectMeta::default(),
            rules: Some(vec![rule("get")]),
        };
        let mut live = Role {
            metadata: ObjectMeta::default(),
            rules: Some(vec![rule("get"), rule("delete")]),
        };
        assert!(Role::converge(&desired, &mut live));
        assert_eq!(live.rules, desired.rules);
        assert!(!Role::converge(&desired, &mut live));
    }

    fn owner(store: &MemoryStore) -> RKEBootstrap {
        let mut bootstrap = RKEBootstrap::new("b", RKEBootstrapSpec::default());
        bootstrap.metadata.namespace = Some("ns".into());
        store.insert(bootstrap).unwrap()
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let store = MemoryStore::new();
        let owner = owner(&store);
        let set = || DesiredSet {
            secrets: vec![secret("s", Some(("value", "v")))],
            ..Default::default()
        };

        assert_eq!(apply(&store, &owner, set()).await.unwrap(), 1);
        assert_eq!(apply(&store, &owner, set()).await.unwrap(), 0);

        let stored = store.get::<Secret>("ns", "s").await.unwrap().unwrap();
        assert_eq!(stored.labels()[BOOTSTRAP_NAME_LABEL], "b");
        let refs = stored.owner_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "RKEBootstrap");
        assert_eq!(refs[0].controller, Some(true));
        assert_eq!(refs[0].block_owner_deletion, Some(true));
    }

    #[tokio::test]
    async fn apply_prunes_only_owned_objects() {
        let store = MemoryStore::new();
        let owner = owner(&store);
        apply(
            &store,
            &owner,
            DesiredSet {
                secrets: vec![secret("keep", None), secret("drop", None)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        // same label, no owner reference
        let mut foreign = secret("foreign", None);
        foreign.metadata.namespace = Some("ns".into());
        foreign.metadata.labels = Some(BTreeMap::from([(BOOTSTRAP_NAME_LABEL.into(), "b".into())]));
        store.insert(foreign).unwrap();

        let writes = apply(
            &store,
            &owner,
            DesiredSet {
                secrets: vec![secret("keep", None)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(writes, 1);
        assert!(store.get::<Secret>("ns", "drop").await.unwrap().is_none());
        assert!(store.get::<Secret>("ns", "keep").await.unwrap().is_some());
        assert!(store.get::<Secret>("ns", "foreign").await.unwrap().is_some());
    }
}
