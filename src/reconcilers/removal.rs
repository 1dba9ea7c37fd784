//! Holding back deletion of bootstraps whose machine is a live etcd member.
//!
//! Etcd machines carry a pre-terminate hook from their first reconciliation on.
//! The hook stops Cluster API from tearing down the machine's infrastructure.
//! It is only released here, once the member is confirmed gone from etcd or
//! the check no longer applies.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::{readiness::owner_machine, Context, Outcome, ETCD_REMOVAL_REQUEUE};
use crate::{
    etcd::Runtime,
    names::kubeconfig_secret_name,
    resources::*,
    store::{annotation_patch, Store},
    Error, Result,
};

/// Key of the kubeconfig inside a cluster's admin kubeconfig secret.
const KUBECONFIG_KEY: &str = "value";

impl RKEBootstrap {
    /// Decide whether this bootstrap may finish deleting.
    ///
    /// `Outcome::Applied` allows the deletion, `Outcome::Skip` holds it back.
    pub async fn remove<S: Store>(&self, ctx: &Context<S>) -> Result<Outcome> {
        let key = object_key(self);
        let namespace = self.namespace().unwrap_or_default();

        let Some(cluster_name) = self.cluster_label() else {
            warn!(bootstrap = %key, "no cluster label, allowing removal without etcd safety check");
            return self.allow_removal(&ctx.store).await;
        };
        let Some(cluster) = ctx.store.get::<Cluster>(&namespace, cluster_name).await? else {
            warn!(bootstrap = %key, cluster = cluster_name, "cluster not found, allowing removal");
            return self.allow_removal(&ctx.store).await;
        };
        let Some(control_plane_ref) = cluster.spec.control_plane_ref.as_ref() else {
            warn!(bootstrap = %key, cluster = cluster_name, "cluster has no control plane, allowing removal");
            return self.allow_removal(&ctx.store).await;
        };
        let control_plane_namespace = control_plane_ref.namespace.as_deref().unwrap_or(&namespace);
        let control_plane_name = control_plane_ref.name.as_deref().unwrap_or_default();
        let Some(control_plane) = ctx
            .store
            .get::<RKEControlPlane>(control_plane_namespace, control_plane_name)
            .await?
        else {
            warn!(bootstrap = %key, cluster = cluster_name, "control plane not found, allowing removal");
            return self.allow_removal(&ctx.store).await;
        };
        let Some(machine) = owner_machine(&ctx.store, self).await? else {
            warn!(bootstrap = %key, "no owning machine, allowing removal");
            return Ok(Outcome::Applied);
        };

        if is_deleting(&control_plane) || is_deleting(&cluster) {
            info!(bootstrap = %key, cluster = cluster_name, "cluster is being deleted, skipping etcd safety check");
            return release_machine(&ctx.store, machine).await;
        }
        if !machine.is_etcd() {
            return release_machine(&ctx.store, machine).await;
        }
        if self.force_remove() {
            info!(bootstrap = %key, machine = %machine.name_any(), "force removal requested, skipping etcd safety check");
            return release_machine(&ctx.store, machine).await;
        }
        let Some(node_name) = machine.node_name() else {
            debug!(bootstrap = %key, machine = %machine.name_any(), "machine never joined, nothing to remove from etcd");
            return release_machine(&ctx.store, machine).await;
        };

        let Some(secret) = ctx
            .store
            .get::<Secret>(&namespace, &kubeconfig_secret_name(cluster_name))
            .await?
        else {
            warn!(bootstrap = %key, cluster = cluster_name, "admin kubeconfig not found, allowing removal");
            return release_machine(&ctx.store, machine).await;
        };
        // a secret without usable content must not pass for a missing one
        let secret_name = secret.name_any();
        let kubeconfig = secret
            .data
            .and_then(|mut data| data.remove(KUBECONFIG_KEY))
            .map(|value| value.0)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::Kubeconfig {
                cluster: cluster_name.to_string(),
                reason: format!("secret {secret_name} has no {KUBECONFIG_KEY} entry"),
            })?;

        let runtime = Runtime::from_kubernetes_version(&control_plane.spec.kubernetes_version);
        let safe = ctx
            .etcd
            .safely_removed(cluster_name, &kubeconfig, runtime, node_name)
            .await?;
        ctx.metrics.etcd_safety_check(safe);
        if !safe {
            info!(bootstrap = %key, node = node_name, "etcd member still present, holding removal");
            ctx.metrics.deferred("etcd_member_present");
            return Ok(Outcome::skip(ETCD_REMOVAL_REQUEUE));
        }

        info!(bootstrap = %key, node = node_name, "etcd member removed");
        release_machine(&ctx.store, machine).await
    }

    /// Allow deletion without the etcd check, releasing the owning machine if it resolves.
    async fn allow_removal<S: Store>(&self, store: &S) -> Result<Outcome> {
        match owner_machine(store, self).await? {
            Some(machine) => release_machine(store, machine).await,
            None => Ok(Outcome::Applied),
        }
    }
}

/// Drop the pre-terminate hook so infrastructure teardown of the machine may go ahead.
async fn release_machine<S: Store>(store: &S, machine: Machine) -> Result<Outcome> {
    if machine.has_pre_terminate_hook() {
        info!(machine = %object_key(&machine), "removing pre-terminate hook");
        let patch = annotation_patch(&machine, PRE_TERMINATE_ANNOTATION, None);
        store.merge_patch(&machine, patch).await?;
    }
    Ok(Outcome::Applied)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::ObjectReference, apimachinery::pkg::apis::meta::v1::Time, ByteString,
    };

    use super::*;
    use crate::reconcilers::{fixtures::*, Reconcile};

    /// An etcd member that has joined as `node-1` and carries the hook.
    async fn joined_etcd_member() -> World {
        let world = world(&[(ETCD_ROLE_LABEL, "true")]);
        world.add_kubeconfig();
        world
            .bootstrap()
            .await
            .reconcile(world.ctx.clone())
            .await
            .unwrap();
        world.update_machine(|m| {
            let status = m.status.get_or_insert_with(Default::default);
            status.phase = Some("Running".into());
            status.node_ref = Some(ObjectReference {
                name: Some("node-1".into()),
                ..Default::default()
            });
        });
        assert!(world.machine().await.owns_pre_terminate_hook());
        world
    }

    async fn remove(world: &World) -> Outcome {
        world.bootstrap().await.remove(&world.ctx).await.unwrap()
    }

    fn now() -> Option<Time> {
        Some(Time(chrono::Utc::now()))
    }

    #[tokio::test]
    async fn holds_until_member_is_removed() {
        let world = joined_etcd_member().await;

        assert_eq!(remove(&world).await, Outcome::skip(ETCD_REMOVAL_REQUEUE));
        assert!(world.machine().await.has_pre_terminate_hook());

        world.etcd.set_safe(true);
        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 2);
    }

    #[tokio::test]
    async fn unsafe_member_is_never_released() {
        let world = joined_etcd_member().await;
        for _ in 0..5 {
            assert_eq!(remove(&world).await, Outcome::skip(ETCD_REMOVAL_REQUEUE));
            assert!(world.machine().await.owns_pre_terminate_hook());
        }
        assert_eq!(world.etcd.calls(), 5);
        let checks = &world.ctx.metrics.etcd_safety_checks;
        assert_eq!(checks.with_label_values(&["unsafe"]).get(), 5);
    }

    #[tokio::test]
    async fn force_remove_skips_the_check() {
        let world = joined_etcd_member().await;
        world.update_bootstrap(|b| {
            b.metadata.annotations = Some(BTreeMap::from([(
                FORCE_REMOVE_ETCD_ANNOTATION.to_string(),
                "True".to_string(),
            )]))
        });

        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);
    }

    #[tokio::test]
    async fn deleting_cluster_skips_the_check() {
        let world = joined_etcd_member().await;
        world.update_cluster(|c| c.metadata.deletion_timestamp = now());

        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);
    }

    #[tokio::test]
    async fn deleting_control_plane_skips_the_check() {
        let world = joined_etcd_member().await;
        let mut control_plane: RKEControlPlane = world.store().get(NS, CLUSTER).await.unwrap().unwrap();
        control_plane.metadata.deletion_timestamp = now();
        world.store().insert(control_plane).unwrap();

        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);
    }

    #[tokio::test]
    async fn workers_never_query_etcd() {
        let world = world(&[("rke.cattle.io/worker-role", "true")]);
        world.add_kubeconfig();
        world.update_machine(|m| {
            m.status.get_or_insert_with(Default::default).node_ref = Some(ObjectReference {
                name: Some("node-1".into()),
                ..Default::default()
            });
        });

        assert_eq!(remove(&world).await, Outcome::Applied);
        assert_eq!(world.etcd.calls(), 0);
    }

    #[tokio::test]
    async fn unjoined_member_is_released() {
        let world = world(&[(ETCD_ROLE_LABEL, "true")]);
        world.bootstrap().await.reconcile(world.ctx.clone()).await.unwrap();
        assert!(world.machine().await.has_pre_terminate_hook());

        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);
    }

    #[tokio::test]
    async fn missing_kubeconfig_releases() {
        let world = joined_etcd_member().await;
        world
            .store()
            .delete::<Secret>(NS, &kubeconfig_secret_name(CLUSTER))
            .await
            .unwrap();

        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);
    }

    #[tokio::test]
    async fn empty_kubeconfig_holds_removal() {
        for data in [
            BTreeMap::from([("other".to_string(), ByteString(b"x".to_vec()))]),
            BTreeMap::from([(KUBECONFIG_KEY.to_string(), ByteString(Vec::new()))]),
        ] {
            let world = joined_etcd_member().await;
            let mut secret = world.secret(&kubeconfig_secret_name(CLUSTER)).await.unwrap();
            secret.data = Some(data);
            world.store().insert(secret).unwrap();

            let err = world.bootstrap().await.remove(&world.ctx).await.unwrap_err();
            assert!(matches!(err, Error::Kubeconfig { .. }), "{err:?}");
            assert!(world.machine().await.owns_pre_terminate_hook());
            assert_eq!(world.etcd.calls(), 0);
        }
    }

    #[tokio::test]
    async fn unresolvable_state_allows_removal() {
        // without an owner there is no machine to release
        let world = joined_etcd_member().await;
        world.update_bootstrap(|b| b.metadata.owner_references = None);
        assert_eq!(remove(&world).await, Outcome::Applied);
        assert_eq!(world.etcd.calls(), 0);

        let world = joined_etcd_member().await;
        world.update_bootstrap(|b| b.metadata.labels = None);
        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);

        let world = joined_etcd_member().await;
        world.update_cluster(|c| c.spec.control_plane_ref = None);
        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);

        let world = joined_etcd_member().await;
        world.store().delete::<Cluster>(NS, CLUSTER).await.unwrap();
        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);

        let world = joined_etcd_member().await;
        world.store().delete::<RKEControlPlane>(NS, CLUSTER).await.unwrap();
        assert_eq!(remove(&world).await, Outcome::Applied);
        assert!(!world.machine().await.has_pre_terminate_hook());
        assert_eq!(world.etcd.calls(), 0);
    }

    #[tokio::test]
    async fn cleanup_goes_through_the_gate() {
        let world = joined_etcd_member().await;
        let bootstrap = world.bootstrap().await;
        assert_eq!(
            bootstrap.cleanup(world.ctx.clone()).await.unwrap(),
            Outcome::skip(ETCD_REMOVAL_REQUEUE)
        );
        world.etcd.set_safe(true);
        assert_eq!(bootstrap.cleanup(world.ctx.clone()).await.unwrap(), Outcome::Applied);
    }
}
