//! The capability seam between the engines and the cluster.
//!
//! Both reconcile modes are written against [`ClusterApi`], the single
//! interface covering everything they may observe or mutate. Production uses
//! [`KubeCluster`]; tests use the in-memory fake from
//! [`crate::test_support`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaim, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;

/// Namespace/name address of a cluster object.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        NamespacedName {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Severity of an emitted event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Everything the reconcile engines need from the cluster.
///
/// Gets return `None` for missing objects; a delete whose target is already
/// gone is not an error. All other failures surface as [`kube::Error`] and
/// are treated as transient by the callers.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_statefulset(&self, key: &NamespacedName) -> kube::Result<Option<StatefulSet>>;
    async fn update_statefulset(&self, sts: &StatefulSet) -> kube::Result<()>;

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> kube::Result<Vec<PersistentVolumeClaim>>;
    async fn get_claim(&self, key: &NamespacedName) -> kube::Result<Option<PersistentVolumeClaim>>;
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> kube::Result<()>;
    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> kube::Result<()>;
    async fn delete_claim(&self, key: &NamespacedName) -> kube::Result<()>;

    async fn get_job(&self, key: &NamespacedName) -> kube::Result<Option<Job>>;
    async fn create_job(&self, job: &Job) -> kube::Result<()>;
    /// Foreground propagation, so the job's pods release their volume mounts
    /// before the deletion is considered complete.
    async fn delete_job(&self, key: &NamespacedName) -> kube::Result<()>;

    async fn get_service_account(&self, key: &NamespacedName) -> kube::Result<Option<ServiceAccount>>;
    async fn create_service_account(&self, sa: &ServiceAccount) -> kube::Result<()>;
    async fn delete_service_account(&self, key: &NamespacedName) -> kube::Result<()>;

    async fn get_role_binding(&self, key: &NamespacedName) -> kube::Result<Option<RoleBinding>>;
    async fn create_role_binding(&self, rb: &RoleBinding) -> kube::Result<()>;
    async fn delete_role_binding(&self, key: &NamespacedName) -> kube::Result<()>;

    async fn publish_event(
        &self,
        sts: &StatefulSet,
        severity: EventSeverity,
        reason: &str,
        note: &str,
    ) -> kube::Result<()>;
}

/// [`ClusterApi`] implemented with a [`kube::Client`].
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    reporter: Reporter,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        KubeCluster {
            client,
            reporter: Reporter {
                controller: "sts-resize-controller".into(),
                instance: None,
            },
        }
    }

    fn statefulsets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn ignore_not_found(err: kube::Error) -> kube::Result<()> {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Ok(()),
        other => Err(other),
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_statefulset(&self, key: &NamespacedName) -> kube::Result<Option<StatefulSet>> {
        self.statefulsets(&key.namespace).get_opt(&key.name).await
    }

    async fn update_statefulset(&self, sts: &StatefulSet) -> kube::Result<()> {
        let namespace = sts.metadata.namespace.as_deref().unwrap_or_default();
        let name = sts.metadata.name.as_deref().unwrap_or_default();
        self.statefulsets(namespace)
            .replace(name, &PostParams::default(), sts)
            .await
            .map(|_| ())
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> kube::Result<Vec<PersistentVolumeClaim>> {
        let lp = ListParams::default().labels(&selector_string(selector));
        Ok(self.claims(namespace).list(&lp).await?.items)
    }

    async fn get_claim(&self, key: &NamespacedName) -> kube::Result<Option<PersistentVolumeClaim>> {
        self.claims(&key.namespace).get_opt(&key.name).await
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> kube::Result<()> {
        let namespace = claim.metadata.namespace.as_deref().unwrap_or_default();
        self.claims(namespace)
            .create(&PostParams::default(), claim)
            .await
            .map(|_| ())
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> kube::Result<()> {
        let namespace = claim.metadata.namespace.as_deref().unwrap_or_default();
        let name = claim.metadata.name.as_deref().unwrap_or_default();
        self.claims(namespace)
            .replace(name, &PostParams::default(), claim)
            .await
            .map(|_| ())
    }

    async fn delete_claim(&self, key: &NamespacedName) -> kube::Result<()> {
        self.claims(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .or_else(ignore_not_found)
    }

    async fn get_job(&self, key: &NamespacedName) -> kube::Result<Option<Job>> {
        self.jobs(&key.namespace).get_opt(&key.name).await
    }

    async fn create_job(&self, job: &Job) -> kube::Result<()> {
        let namespace = job.metadata.namespace.as_deref().unwrap_or_default();
        self.jobs(namespace)
            .create(&PostParams::default(), job)
            .await
            .map(|_| ())
    }

    async fn delete_job(&self, key: &NamespacedName) -> kube::Result<()> {
        self.jobs(&key.namespace)
            .delete(&key.name, &DeleteParams::foreground())
            .await
            .map(|_| ())
            .or_else(ignore_not_found)
    }

    async fn get_service_account(&self, key: &NamespacedName) -> kube::Result<Option<ServiceAccount>> {
        Api::<ServiceAccount>::namespaced(self.client.clone(), &key.namespace)
            .get_opt(&key.name)
            .await
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> kube::Result<()> {
        let namespace = sa.metadata.namespace.as_deref().unwrap_or_default();
        Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), sa)
            .await
            .map(|_| ())
    }

    async fn delete_service_account(&self, key: &NamespacedName) -> kube::Result<()> {
        Api::<ServiceAccount>::namespaced(self.client.clone(), &key.namespace)
            .delete(&key.name, &DeleteParams::foreground())
            .await
            .map(|_| ())
            .or_else(ignore_not_found)
    }

    async fn get_role_binding(&self, key: &NamespacedName) -> kube::Result<Option<RoleBinding>> {
        Api::<RoleBinding>::namespaced(self.client.clone(), &key.namespace)
            .get_opt(&key.name)
            .await
    }

    async fn create_role_binding(&self, rb: &RoleBinding) -> kube::Result<()> {
        let namespace = rb.metadata.namespace.as_deref().unwrap_or_default();
        Api::<RoleBinding>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), rb)
            .await
            .map(|_| ())
    }

    async fn delete_role_binding(&self, key: &NamespacedName) -> kube::Result<()> {
        Api::<RoleBinding>::namespaced(self.client.clone(), &key.namespace)
            .delete(&key.name, &DeleteParams::foreground())
            .await
            .map(|_| ())
            .or_else(ignore_not_found)
    }

    async fn publish_event(
        &self,
        sts: &StatefulSet,
        severity: EventSeverity,
        reason: &str,
        note: &str,
    ) -> kube::Result<()> {
        let reference = ObjectReference {
            api_version: Some("apps/v1".to_string()),
            kind: Some("StatefulSet".to_string()),
            name: sts.metadata.name.clone(),
            namespace: sts.metadata.namespace.clone(),
            uid: sts.metadata.uid.clone(),
            ..Default::default()
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        recorder
            .publish(Event {
                type_: match severity {
                    EventSeverity::Normal => EventType::Normal,
                    EventSeverity::Warning => EventType::Warning,
                },
                reason: reason.to_string(),
                note: Some(note.to_string()),
                action: "Resizing".to_string(),
                secondary: None,
            })
            .await
    }
}
