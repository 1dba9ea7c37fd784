use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Secret, ServiceAccount},
};
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

use super::{
    artifacts,
    readiness::{self, Readiness},
    Context, Outcome, Reconcile, READINESS_REQUEUE,
};
use crate::{
    apply::{apply, DesiredSet},
    config::Settings,
    installer::{Platform, ScriptRequest},
    names::token_secret_name,
    resources::*,
    store::{annotation_patch, locate, Store},
    Error, Result,
};

/// What one pass over a bootstrap wants the world to look like
#[derive(Debug)]
pub struct Generated {
    pub objects: DesiredSet,
    pub status: RKEBootstrapStatus,
    pub outcome: Outcome,
}

impl Generated {
    fn skip(status: RKEBootstrapStatus) -> Self {
        Self {
            objects: DesiredSet::default(),
            status,
            outcome: Outcome::skip(READINESS_REQUEUE),
        }
    }
}

impl RKEBootstrap {
    /// Fill in the cluster name from the cluster label on bootstraps created without one.
    pub async fn on_change<S: Store>(&self, ctx: &Context<S>) -> Result<RKEBootstrap> {
        if is_deleting(self) || !self.spec.cluster_name.is_empty() {
            return Ok(self.clone());
        }
        let Some(cluster) = self.cluster_label() else {
            return Ok(self.clone());
        };

        info!(bootstrap = %object_key(self), cluster, "setting cluster name from label");
        let patch = json!({
            "metadata": { "resourceVersion": self.resource_version() },
            "spec": { "clusterName": cluster },
        });
        ctx.store.merge_patch(self, patch).await
    }

    /// Work out every object that should exist for this bootstrap, and its status.
    ///
    /// Marks etcd machines with the pre-terminate hook on the way.
    pub async fn generate<S: Store>(
        &self,
        status: RKEBootstrapStatus,
        ctx: &Context<S>,
    ) -> Result<Generated> {
        let (machine, cluster) = match readiness::evaluate(&ctx.store, self, &ctx.metrics).await? {
            Readiness::Ready { machine, cluster } => (machine, cluster),
            Readiness::Waiting(_) => return Ok(Generated::skip(status)),
        };

        let mut objects = artifacts::plan_objects(&machine, self);
        let machine = self.hold_teardown(machine, ctx).await?;

        let mut status = status;
        if machine.phase().needs_bootstrap() {
            let (bootstrap, secret) = self.bootstrap_objects(&machine, &cluster, ctx).await?;
            objects.service_accounts.push(bootstrap);
            if let Some(secret) = secret {
                if status.data_secret_name.is_none() {
                    status.data_secret_name = Some(secret.name_any());
                    status.ready = true;
                }
                objects.secrets.push(secret);
            }
        }

        Ok(Generated {
            objects,
            status,
            outcome: Outcome::Applied,
        })
    }

    /// Put the pre-terminate hook on etcd machines that do not carry ours yet.
    async fn hold_teardown<S: Store>(&self, machine: Machine, ctx: &Context<S>) -> Result<Machine> {
        if !machine.is_etcd() || machine.owns_pre_terminate_hook() {
            return Ok(machine);
        }
        info!(bootstrap = %object_key(self), machine = %machine.name_any(), "adding pre-terminate hook to etcd machine");
        let patch = annotation_patch(&machine, PRE_TERMINATE_ANNOTATION, Some(PRE_TERMINATE_OWNER));
        ctx.store.merge_patch(&machine, patch).await
    }

    /// The bootstrap service account, and once its token exists, the install secret.
    async fn bootstrap_objects<S: Store>(
        &self,
        machine: &Machine,
        cluster: &Cluster,
        ctx: &Context<S>,
    ) -> Result<(ServiceAccount, Option<Secret>)> {
        let desired = artifacts::bootstrap_service_account(machine, self);
        let (namespace, name) = locate(&desired)?;
        let Some(service_account) = ctx.store.get::<ServiceAccount>(&namespace, &name).await? else {
            debug!(bootstrap = %object_key(self), "bootstrap service account not created yet");
            return Ok((desired, None));
        };

        let token = service_account_token(&ctx.store, &service_account).await?;
        let env_vars = agent_env_vars(&ctx.store, self, cluster).await?;
        let internal_api = server_has_host_port(&ctx.store, &ctx.settings).await?;
        let script = ctx.installer.script(&ScriptRequest {
            token: &artifacts::token_hash(&token),
            env_vars: &env_vars,
            platform: Platform::of(machine),
            internal_api,
        })?;
        Ok((desired, Some(artifacts::bootstrap_secret(machine, self, script))))
    }

    async fn update_status<S: Store>(&self, status: &RKEBootstrapStatus, ctx: &Context<S>) -> Result<()> {
        let patch = json!({
            "metadata": { "resourceVersion": self.resource_version() },
            "status": status,
        });
        ctx.store.merge_patch_status(self, patch).await?;
        Ok(())
    }
}

/// The token of a service account, asking for one to be issued when there is none.
async fn service_account_token<S: Store>(store: &S, service_account: &ServiceAccount) -> Result<Vec<u8>> {
    let (namespace, name) = locate(service_account)?;
    let secret = match store.get::<Secret>(&namespace, &token_secret_name(&name)).await? {
        Some(secret) => secret,
        None => {
            let request = artifacts::token_secret(service_account).ok_or(Error::MissingObjectKey {
                kind: "ServiceAccount",
                field: "uid",
            })?;
            debug!(service_account = %name, "requesting service account token");
            store.create(&request).await?
        }
    };
    match artifacts::token_of(&secret) {
        Some(token) => Ok(token.to_vec()),
        None => Err(Error::TokenPending(format!("{namespace}/{name}"))),
    }
}

/// Environment variables handed to node agents by an RKE control plane.
async fn agent_env_vars<S: Store>(store: &S, bootstrap: &RKEBootstrap, cluster: &Cluster) -> Result<Vec<EnvVar>> {
    let control_plane = cluster
        .spec
        .control_plane_ref
        .as_ref()
        .filter(|r| r.kind.as_deref() == Some("RKEControlPlane"));
    let Some(name) = control_plane.and_then(|r| r.name.as_deref()) else {
        return Ok(Vec::new());
    };
    let namespace = bootstrap.namespace().unwrap_or_default();
    match store.get::<RKEControlPlane>(&namespace, name).await? {
        Some(control_plane) => Ok(control_plane.spec.agent_env_vars),
        None => Err(Error::NotFound {
            kind: "RKEControlPlane".into(),
            key: format!("{namespace}/{name}"),
        }),
    }
}

/// Whether the server deployment exposes a port on the host network of its nodes.
async fn server_has_host_port<S: Store>(store: &S, settings: &Settings) -> Result<bool> {
    let deployment = store
        .get::<Deployment>(&settings.system_namespace, &settings.server_deployment)
        .await?;
    Ok(deployment
        .iter()
        .filter_map(|d| d.spec.as_ref())
        .filter_map(|s| s.template.spec.as_ref())
        .flat_map(|p| &p.containers)
        .filter(|c| c.name == settings.server_deployment)
        .flat_map(|c| c.ports.iter().flatten())
        .any(|p| p.host_port.unwrap_or(0) != 0))
}

#[async_trait]
impl<S: Store> Reconcile<Context<S>> for RKEBootstrap {
    async fn reconcile(&self, ctx: Arc<Context<S>>) -> Result<Outcome> {
        let bootstrap = self.on_change(&ctx).await?;
        let status = bootstrap.status.clone().unwrap_or_default();
        let generated = bootstrap.generate(status.clone(), &ctx).await?;
        if generated.outcome != Outcome::Applied {
            return Ok(generated.outcome);
        }

        let writes = apply(&ctx.store, &bootstrap, generated.objects).await?;
        debug!(bootstrap = %object_key(&bootstrap), writes, "applied generated objects");

        if generated.status != status {
            info!(bootstrap = %object_key(&bootstrap), secret = ?generated.status.data_secret_name, "bootstrap data ready");
            bootstrap.update_status(&generated.status, &ctx).await?;
        }
        Ok(Outcome::Applied)
    }

    async fn cleanup(&self, ctx: Arc<Context<S>>) -> Result<Outcome> {
        self.remove(&ctx).await
    }
}
