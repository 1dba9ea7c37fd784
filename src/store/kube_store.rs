use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api, Client,
};
use serde_json::Value;

use super::{locate, Managed, Store};
use crate::{Error, Result};

const FIELD_MANAGER: &str = "rke-bootstrap-operator";

/// A [`Store`] talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        }
    }
}

/// Translate optimistic-concurrency and missing-object failures into our own errors
fn classify<K: Managed>(err: kube::Error, namespace: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ref e) if e.code == 409 => Error::Conflict {
            kind: K::kind(&()).into_owned(),
            key: format!("{namespace}/{name}"),
        },
        kube::Error::Api(ref e) if e.code == 404 => Error::NotFound {
            kind: K::kind(&()).into_owned(),
            key: format!("{namespace}/{name}"),
        },
        other => Error::KubeError(other),
    }
}

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: Managed>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&selector(labels));
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K: Managed>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        self.api::<K>(&namespace)
            .create(&Self::post_params(), obj)
            .await
            .map_err(|e| classify::<K>(e, &namespace, &name))
    }

    async fn replace<K: Managed>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        self.api::<K>(&namespace)
            .replace(&name, &Self::post_params(), obj)
            .await
            .map_err(|e| classify::<K>(e, &namespace, &name))
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn merge_patch<K: Managed>(&self, obj: &K, patch: Value) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        self.api::<K>(&namespace)
            .patch(&name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify::<K>(e, &namespace, &name))
    }

    async fn merge_patch_status<K: Managed>(&self, obj: &K, patch: Value) -> Result<K> {
        let (namespace, name) = locate(obj)?;
        self.api::<K>(&namespace)
            .patch_status(&name, &Self::patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify::<K>(e, &namespace, &name))
    }
}
