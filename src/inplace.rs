//! In-place reconcile mode.
//!
//! For storage classes that support native volume expansion there is no need
//! to quiesce or copy anything: the claim's storage request is raised
//! directly and the CSI driver grows the volume underneath the running pods.
//! Opt-in per StatefulSet through a gating label.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, KubeCluster, NamespacedName};
use crate::errors::ResizeError;
use crate::resize;

/// Patches undersized claims of gated StatefulSets to their template size.
pub struct InplaceController<C> {
    cluster: C,
    label_name: String,
}

impl<C: ClusterApi> InplaceController<C> {
    pub fn new(cluster: C, label_name: String) -> Self {
        InplaceController { cluster, label_name }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// One reconcile pass. All failures are transient: the update either
    /// succeeds eventually or keeps being retried with backoff.
    pub async fn reconcile(&self, key: &NamespacedName) -> Result<(), ResizeError> {
        let Some(sts) = self.cluster.get_statefulset(key).await? else {
            return Ok(());
        };

        let gated = sts
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(&self.label_name))
            .is_some_and(|v| v == "true");
        if !gated {
            debug!(statefulset = %key, label = %self.label_name, "not gated, skipping");
            return Ok(());
        }

        let volumes = resize::fetch_resizable(&self.cluster, &sts).await?;
        if volumes.is_empty() {
            debug!(statefulset = %key, "all claims have the right size");
            return Ok(());
        }

        for vol in volumes {
            let claim_key = vol.source_key();
            // Work on the live claim so everything but the request, storage
            // class and volume binding included, is preserved.
            let Some(mut claim) = self.cluster.get_claim(&claim_key).await? else {
                continue;
            };
            if let Some(resources) = claim.spec.as_mut().and_then(|s| s.resources.as_mut()) {
                resources
                    .requests
                    .get_or_insert_with(Default::default)
                    .insert("storage".to_string(), vol.target_size.clone());
            }
            info!(claim = %claim_key, size = %vol.target_size.0, "expanding claim in place");
            self.cluster.update_claim(&claim).await?;
        }
        Ok(())
    }
}

/// Runs the in-place controller against the cluster until shutdown.
pub async fn run(client: Client, label_name: String) {
    let context = Arc::new(InplaceController::new(
        KubeCluster::new(client.clone()),
        label_name,
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
    ctx: Arc<InplaceController<KubeCluster>>,
) -> Result<Action, ResizeError> {
    let key = NamespacedName::new(&sts.namespace().unwrap_or_default(), &sts.name_any());
    ctx.reconcile(&key).await?;
    Ok(Action::await_change())
}

fn error_policy(
    _sts: Arc<StatefulSet>,
    err: &ResizeError,
    _ctx: Arc<InplaceController<KubeCluster>>,
) -> Action {
    warn!(error = %err, "reconcile failed, backing off");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{source_pvc, statefulset, FakeCluster};
    use crate::volume::storage_request;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    const GATE: &str = "sts-resize.pikach.us/resize-inplace";

    fn gated_statefulset() -> StatefulSet {
        let mut sts = statefulset("ns", "web", 2, "data", "2Gi");
        sts.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(GATE.to_string(), "true".to_string());
        sts
    }

    #[tokio::test]
    async fn expands_claims_of_gated_statefulset() {
        let cluster = FakeCluster::new();
        cluster.put_statefulset(gated_statefulset());
        cluster.put_claim(source_pvc("ns", "data-web-0", "1Gi"));
        cluster.put_claim(source_pvc("ns", "data-web-1", "1Gi"));

        let ctl = InplaceController::new(cluster, GATE.to_string());
        ctl.reconcile(&NamespacedName::new("ns", "web")).await.unwrap();

        for name in ["data-web-0", "data-web-1"] {
            let claim = ctl.cluster.claim("ns", name).unwrap();
            assert_eq!(storage_request(&claim), Some(&Quantity("2Gi".into())));
        }
        assert!(ctl.cluster.jobs().is_empty(), "no copy jobs in in-place mode");
        let sts = ctl.cluster.statefulset("ns", "web").unwrap();
        assert_eq!(
            sts.spec.as_ref().unwrap().replicas,
            Some(2),
            "in-place mode must not quiesce"
        );
        assert!(sts.metadata.annotations.is_none(), "no descriptor persistence");
    }

    #[tokio::test]
    async fn ignores_ungated_statefulset() {
        let cluster = FakeCluster::new();
        cluster.put_statefulset(statefulset("ns", "web", 2, "data", "2Gi"));
        cluster.put_claim(source_pvc("ns", "data-web-0", "1Gi"));

        let ctl = InplaceController::new(cluster, GATE.to_string());
        ctl.reconcile(&NamespacedName::new("ns", "web")).await.unwrap();

        let claim = ctl.cluster.claim("ns", "data-web-0").unwrap();
        assert_eq!(storage_request(&claim), Some(&Quantity("1Gi".into())));
    }

    #[tokio::test]
    async fn right_sized_claims_are_untouched() {
        let cluster = FakeCluster::new();
        cluster.put_statefulset(gated_statefulset());
        cluster.put_claim(source_pvc("ns", "data-web-0", "2Gi"));

        let ctl = InplaceController::new(cluster, GATE.to_string());
        ctl.cluster.reset_mutations();
        ctl.reconcile(&NamespacedName::new("ns", "web")).await.unwrap();
        assert_eq!(ctl.cluster.mutation_count(), 0);
    }
}
