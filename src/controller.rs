//! The per-StatefulSet reconcile engine.
//!
//! One pass is a straight-line computation that suspends only at cluster API
//! calls and commits at most one StatefulSet update. Everything it needs to
//! continue after a crash is re-derived from the object's annotations and
//! from the auxiliary objects it re-finds by deterministic name.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, EventSeverity, KubeCluster, NamespacedName};
use crate::errors::{Progress, ResizeError};
use crate::rbac;
use crate::resize;
use crate::statefulset::StatefulSetInfo;

/// Startup configuration shared by both reconcile modes.
#[derive(Clone, Debug)]
pub struct Options {
    /// Container image providing rsync for the copy-jobs.
    pub sync_image: String,
    /// ClusterRole the copy-jobs run under, if the cluster requires one.
    pub sync_cluster_role: Option<String>,
    /// Only StatefulSets carrying this label with value "true" are handled.
    pub label_gate: Option<String>,
    /// Poll interval while waiting on the cluster.
    pub requeue_after: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            sync_image: "instrumentisto/rsync-ssh".to_string(),
            sync_cluster_role: None,
            label_gate: None,
            requeue_after: Duration::from_secs(10),
        }
    }
}

/// Drives StatefulSets whose claim templates grew through the
/// quiesce / backup / recreate / restore / resume sequence.
pub struct ResizeController<C> {
    cluster: C,
    options: Options,
}

impl<C: ClusterApi> ResizeController<C> {
    pub fn new(cluster: C, options: Options) -> Self {
        ResizeController { cluster, options }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// One reconcile pass for the StatefulSet at `key`.
    ///
    /// Returns the requeue interval when the pass is waiting on the cluster,
    /// `None` when there is nothing further to do. Transient cluster errors
    /// propagate so the runtime retries with backoff; terminal failures are
    /// absorbed here by marking the object failed.
    pub async fn reconcile(&self, key: &NamespacedName) -> Result<Option<Duration>, ResizeError> {
        let Some(observed) = self.cluster.get_statefulset(key).await? else {
            // Deleted between notification and read.
            return Ok(None);
        };

        if let Some(gate) = &self.options.label_gate {
            let gated = observed
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(gate))
                .is_some_and(|v| v == "true");
            if !gated {
                return Ok(None);
            }
        }

        let mut info = match StatefulSetInfo::new(&observed) {
            Ok(info) => info,
            Err(e) => {
                // The persisted plan is unreadable; nothing automatic is safe.
                warn!(statefulset = %key, error = %e, "persisted resize state unreadable");
                self.emit(&observed, EventSeverity::Warning, "ResizeFailed", &e.to_string())
                    .await;
                let mut info = StatefulSetInfo::without_plan(&observed);
                info.set_failed();
                self.commit(&info).await?;
                return Ok(None);
            }
        };

        if info.failed() {
            return Ok(None);
        }

        if !info.had_plan() {
            info.volumes = resize::fetch_resizable(&self.cluster, &observed).await?;
        }

        if !info.resizing() && !info.resuming() {
            if info.had_plan() {
                // Leftover empty plan from a completed run; clear it so
                // future size bumps are discovered again.
                info.clear_plan();
                self.commit(&info).await?;
            }
            return Ok(None);
        }

        let requeue = match self.resize(&mut info).await {
            Ok(Progress::Done) => {
                info.clear_plan();
                info!(statefulset = %key, "resize complete");
                self.emit(
                    &observed,
                    EventSeverity::Normal,
                    "ResizeComplete",
                    "Successfully resized StatefulSet",
                )
                .await;
                None
            }
            Ok(Progress::InProgress) => Some(self.options.requeue_after),
            Err(ResizeError::Kube(e)) => return Err(e.into()),
            Err(e) => {
                warn!(statefulset = %key, error = %e, "unable to resize");
                self.emit(&observed, EventSeverity::Warning, "ResizeFailed", &e.to_string())
                    .await;
                if e.safe_to_scale_up() {
                    if let Err(scale_err) = info.prepare_scale_up() {
                        warn!(statefulset = %key, error = %scale_err, "unable to scale back up");
                    }
                }
                info.set_failed();
                None
            }
        };

        self.commit(&info).await?;
        Ok(requeue)
    }

    // Quiesce, migrate every pending volume, resume. Each call advances as
    // far as the observed cluster state allows.
    async fn resize(&self, info: &mut StatefulSetInfo) -> Result<Progress, ResizeError> {
        if !info.prepare_scale_down() {
            return Ok(Progress::InProgress);
        }

        let namespace = info.namespace().to_string();
        let name = info.name().to_string();
        let role = self.options.sync_cluster_role.as_deref();
        let service_account = rbac::ensure_sync_rbac(&self.cluster, &namespace, &name, role).await?;

        if resize::resize_volumes(
            &self.cluster,
            &self.options.sync_image,
            service_account.as_deref(),
            &mut info.volumes,
        )
        .await?
            == Progress::InProgress
        {
            return Ok(Progress::InProgress);
        }

        if !info.prepare_scale_up()? {
            return Ok(Progress::InProgress);
        }
        rbac::cleanup_sync_rbac(&self.cluster, &namespace, &name, role).await?;
        Ok(Progress::Done)
    }

    // Single mutation path: write the StatefulSet back only when the pass
    // actually changed it.
    async fn commit(&self, info: &StatefulSetInfo) -> Result<(), ResizeError> {
        let updated = info.statefulset()?;
        let old = &info.old;
        if updated.metadata.annotations != old.metadata.annotations
            || updated.metadata.labels != old.metadata.labels
            || updated.spec != old.spec
        {
            debug!(
                statefulset = %NamespacedName::new(info.namespace(), info.name()),
                "updating statefulset"
            );
            self.cluster.update_statefulset(&updated).await?;
        }
        Ok(())
    }

    // Events are best-effort; losing one must not stall the resize.
    async fn emit(&self, sts: &StatefulSet, severity: EventSeverity, reason: &str, note: &str) {
        if let Err(e) = self.cluster.publish_event(sts, severity, reason, note).await {
            warn!(error = %e, reason, "unable to publish event");
        }
    }
}

/// Runs the controller against the cluster until shutdown.
pub async fn run(client: Client, options: Options) {
    let context = Arc::new(ResizeController::new(
        KubeCluster::new(client.clone()),
        options,
    ));
    let statefulsets = Api::<StatefulSet>::all(client);
    Controller::new(statefulsets, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_one, error_policy, context)
        .for_each(|res| {
            match res {
                Ok((object, _)) => debug!(%object, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile error"),
            }
            futures::future::ready(())
        })
        .await;
}

async fn reconcile_one(
    sts: Arc<StatefulSet>,
    ctx: Arc<ResizeController<KubeCluster>>,
) -> Result<Action, ResizeError> {
    let key = NamespacedName::new(&sts.namespace().unwrap_or_default(), &sts.name_any());
    match ctx.reconcile(&key).await? {
        Some(after) => Ok(Action::requeue(after)),
        None => Ok(Action::await_change()),
    }
}

fn error_policy(
    _sts: Arc<StatefulSet>,
    err: &ResizeError,
    _ctx: Arc<ResizeController<KubeCluster>>,
) -> Action {
    warn!(error = %err, "reconcile failed, backing off");
    Action::requeue(Duration::from_secs(30))
}
