use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::{
    api::ListParams,
    runtime::{
        controller::Action,
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
        Controller,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::{
    config::Settings,
    etcd::NodeAnnotationProbe,
    installer::TemplateInstaller,
    reconcilers::{Context, Outcome, Reconcile},
    resources::{object_key, Machine, RKEBootstrap, BOOTSTRAP_NAME_LABEL},
    store::KubeStore,
    telemetry, triggers, Error, Metrics, Result,
};

/// Finalizer holding back bootstrap deletion until its etcd member is gone
pub const BOOTSTRAP_FINALIZER: &str = "rke.cattle.io/bootstrap-etcd-removal";

/// Requeue delay after an unexpected failure
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "rke-bootstrap-operator".into(),
        }
    }
}
impl Diagnostics {
    pub fn recorder(&self, client: Client, bootstrap: &RKEBootstrap) -> Recorder {
        Recorder::new(client, self.reporter.clone(), bootstrap.object_ref(&()))
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub(crate) fn to_context(&self, client: Client, settings: Settings) -> Arc<Context<KubeStore>> {
        Arc::new(Context {
            store: KubeStore::new(client),
            etcd: Arc::new(NodeAnnotationProbe::new(settings.etcd_probe_timeout)),
            installer: Arc::new(TemplateInstaller::new(&settings)),
            settings,
            diagnostics: self.diagnostics.clone(),
            metrics: Metrics::default().register(&self.registry).unwrap(),
        })
    }
}

pub struct BootstrapController {
    state: State,
}

impl BootstrapController {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    /// Initialize the controller and shared state (given the crd is installed)
    pub async fn run(self, settings: Settings) -> Result<(), anyhow::Error> {
        // Get a k8s client for communicating with the cluster
        let client = Client::try_default().await?;

        let bootstraps = Api::<RKEBootstrap>::all(client.clone());
        let service_accounts = Api::<ServiceAccount>::all(client.clone());
        let machines = Api::<Machine>::all(client.clone());

        // Test that we can actually query for our CRDs (a.k.a. they are installed)
        if let Err(e) = bootstraps.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
            std::process::exit(1);
        }

        if let Some(instance) = &settings.pod_name {
            self.state.diagnostics.write().await.reporter.instance = Some(instance.clone());
        }

        let watching_config = Config::default().page_size(50).any_semantic();
        Controller::new(bootstraps, watching_config.clone())
            .shutdown_on_signal()
            .watches(
                service_accounts,
                watching_config.clone().labels(BOOTSTRAP_NAME_LABEL),
                |sa| triggers::from_service_account(&sa),
            )
            .watches(machines, watching_config, |machine| {
                triggers::from_machine(&machine)
            })
            .run(reconcile, error_policy, self.state.to_context(client, settings))
            .filter_map(|x| async move { Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .await;

        Ok(())
    }
}

/// Error handler for failed reconciliations
fn error_policy(bootstrap: Arc<RKEBootstrap>, error: &Error, ctx: Arc<Context<KubeStore>>) -> Action {
    if let Some(delay) = error.deferred_for() {
        return Action::requeue(delay);
    }
    match error {
        Error::Conflict { .. } | Error::TokenPending(_) => {
            warn!(bootstrap = %object_key(bootstrap.as_ref()), "reconcile postponed: {error}")
        }
        _ => error!("reconcile failed: {:?}", error),
    }
    ctx.metrics.reconcile_failure(&bootstrap, error);
    Action::requeue(ERROR_REQUEUE)
}

fn to_action(outcome: Outcome) -> Action {
    match outcome {
        Outcome::Applied => Action::await_change(),
        Outcome::Skip { retry_after } => Action::requeue(retry_after),
    }
}

/// Finalizer cleanup: hold deletion while the etcd member is still around
async fn cleanup(bootstrap: Arc<RKEBootstrap>, ctx: Arc<Context<KubeStore>>) -> Result<Action> {
    match bootstrap.cleanup(ctx.clone()).await? {
        Outcome::Applied => Ok(Action::await_change()),
        Outcome::Skip { retry_after } => {
            let recorder = ctx
                .diagnostics
                .read()
                .await
                .recorder(ctx.store.client().clone(), &bootstrap);
            let published = recorder
                .publish(Event {
                    type_: EventType::Warning,
                    reason: "EtcdMemberPresent".into(),
                    note: Some(format!(
                        "Waiting for the etcd member of `{}` to be removed",
                        bootstrap.name_any()
                    )),
                    action: "Deleting".into(),
                    secondary: None,
                })
                .await;
            if let Err(e) = published {
                debug!(bootstrap = %object_key(bootstrap.as_ref()), "failed to publish event: {e}");
            }
            Err(Error::RemovalDeferred(retry_after))
        }
    }
}

/// Reconciler for bootstraps
#[instrument(skip(ctx, bootstrap), fields(trace_id))]
async fn reconcile(bootstrap: Arc<RKEBootstrap>, ctx: Arc<Context<KubeStore>>) -> Result<Action> {
    // Add some tracing for debugging's sake
    let trace_id = telemetry::get_trace_id();

    // Take some metrics to see the average reconcile time
    Span::current().record("trace_id", &field::display(&trace_id));
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = bootstrap.namespace().ok_or(Error::MissingObjectKey {
        kind: "RKEBootstrap",
        field: "namespace",
    })?;
    let bootstraps: Api<RKEBootstrap> = Api::namespaced(ctx.store.client().clone(), &namespace);

    debug!(bootstrap = %object_key(bootstrap.as_ref()), "starting reconciliation");
    finalizer(&bootstraps, BOOTSTRAP_FINALIZER, bootstrap, |event| async {
        match event {
            Finalizer::Apply(b) => b.reconcile(ctx.clone()).await.map(to_action),
            Finalizer::Cleanup(b) => cleanup(b, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_actions() {
        assert_eq!(to_action(Outcome::Applied), Action::await_change());
        assert_eq!(
            to_action(Outcome::skip(Duration::from_secs(10))),
            Action::requeue(Duration::from_secs(10))
        );
    }

    #[test]
    fn deferred_cleanup_is_not_a_failure() {
        let deferred = Error::FinalizerError(Box::new(
            kube::runtime::finalizer::Error::CleanupFailed(Error::RemovalDeferred(Duration::from_secs(5))),
        ));
        assert_eq!(deferred.deferred_for(), Some(Duration::from_secs(5)));

        let failed = Error::FinalizerError(Box::new(
            kube::runtime::finalizer::Error::ApplyFailed(Error::TokenPending("ns/sa".into())),
        ));
        assert_eq!(failed.deferred_for(), None);
    }
}
