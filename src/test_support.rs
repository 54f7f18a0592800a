//! Test support shared by unit and integration tests.
//!
//! [`FakeCluster`] is an in-memory [`ClusterApi`]: reads and writes go to
//! maps keyed by namespace/name, every mutation is counted (the idempotence
//! tests assert on it) and events are recorded instead of published. Helpers
//! play the part of the external controllers: converging a StatefulSet's
//! status and finishing copy-jobs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
    ServiceAccount, VolumeResourceRequirements,
};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::cluster::{ClusterApi, EventSeverity, NamespacedName};

/// An event the fake captured instead of publishing.
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
struct State {
    statefulsets: BTreeMap<(String, String), StatefulSet>,
    claims: BTreeMap<(String, String), PersistentVolumeClaim>,
    jobs: BTreeMap<(String, String), Job>,
    service_accounts: BTreeMap<(String, String), ServiceAccount>,
    role_bindings: BTreeMap<(String, String), RoleBinding>,
    events: Vec<RecordedEvent>,
    mutations: usize,
}

/// In-memory [`ClusterApi`] implementation.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

fn key_of(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn conflict(name: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{name} already exists"),
        reason: "AlreadyExists".to_string(),
        code: 409,
    })
}

impl FakeCluster {
    pub fn new() -> Self {
        FakeCluster::default()
    }

    pub fn put_statefulset(&self, sts: StatefulSet) {
        let mut state = self.state.lock().unwrap();
        state.statefulsets.insert(key_of(&sts.metadata), sts);
    }

    pub fn statefulset(&self, namespace: &str, name: &str) -> Option<StatefulSet> {
        let state = self.state.lock().unwrap();
        state
            .statefulsets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn put_claim(&self, claim: PersistentVolumeClaim) {
        let mut state = self.state.lock().unwrap();
        state.claims.insert(key_of(&claim.metadata), claim);
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        let state = self.state.lock().unwrap();
        state
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn claims(&self) -> Vec<PersistentVolumeClaim> {
        self.state.lock().unwrap().claims.values().cloned().collect()
    }

    pub fn put_job(&self, job: Job) {
        let mut state = self.state.lock().unwrap();
        state.jobs.insert(key_of(&job.metadata), job);
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.state.lock().unwrap().jobs.values().cloned().collect()
    }

    pub fn service_accounts(&self) -> Vec<ServiceAccount> {
        let state = self.state.lock().unwrap();
        state.service_accounts.values().cloned().collect()
    }

    pub fn role_bindings(&self) -> Vec<RoleBinding> {
        self.state.lock().unwrap().role_bindings.values().cloned().collect()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Mutating API calls (create, update, delete) since the last reset.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    pub fn reset_mutations(&self) {
        self.state.lock().unwrap().mutations = 0;
    }

    /// Plays the StatefulSet controller: the observed state catches up with
    /// the desired one and the revision marker proves it ran.
    pub fn converge_statefulset(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(sts) = state
            .statefulsets
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            let status = sts.status.get_or_insert_with(Default::default);
            status.replicas = desired;
            status.current_revision = Some("rev-1".to_string());
        }
    }

    /// Plays the job controller reporting success.
    pub fn complete_job(&self, namespace: &str, name: &str) {
        self.set_job_condition(namespace, name, "Complete");
    }

    /// Plays the job controller reporting terminal failure.
    pub fn fail_job(&self, namespace: &str, name: &str) {
        self.set_job_condition(namespace, name, "Failed");
    }

    fn set_job_condition(&self, namespace: &str, name: &str, kind: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state
            .jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            job.status = Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: kind.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_statefulset(&self, key: &NamespacedName) -> kube::Result<Option<StatefulSet>> {
        Ok(self.statefulset(&key.namespace, &key.name))
    }

    async fn update_statefulset(&self, sts: &StatefulSet) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state.statefulsets.insert(key_of(&sts.metadata), sts.clone());
        Ok(())
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> kube::Result<Vec<PersistentVolumeClaim>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .claims
            .values()
            .filter(|c| c.metadata.namespace.as_deref() == Some(namespace))
            .filter(|c| {
                let labels = c.metadata.labels.clone().unwrap_or_default();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn get_claim(&self, key: &NamespacedName) -> kube::Result<Option<PersistentVolumeClaim>> {
        Ok(self.claim(&key.namespace, &key.name))
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let key = key_of(&claim.metadata);
        if state.claims.contains_key(&key) {
            return Err(conflict(&key.1));
        }
        state.claims.insert(key, claim.clone());
        Ok(())
    }

    async fn update_claim(&self, claim: &PersistentVolumeClaim) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state.claims.insert(key_of(&claim.metadata), claim.clone());
        Ok(())
    }

    async fn delete_claim(&self, key: &NamespacedName) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state
            .claims
            .remove(&(key.namespace.clone(), key.name.clone()));
        Ok(())
    }

    async fn get_job(&self, key: &NamespacedName) -> kube::Result<Option<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .get(&(key.namespace.clone(), key.name.clone()))
            .cloned())
    }

    async fn create_job(&self, job: &Job) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        let key = key_of(&job.metadata);
        if state.jobs.contains_key(&key) {
            return Err(conflict(&key.1));
        }
        state.jobs.insert(key, job.clone());
        Ok(())
    }

    async fn delete_job(&self, key: &NamespacedName) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state
            .jobs
            .remove(&(key.namespace.clone(), key.name.clone()));
        Ok(())
    }

    async fn get_service_account(&self, key: &NamespacedName) -> kube::Result<Option<ServiceAccount>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .service_accounts
            .get(&(key.namespace.clone(), key.name.clone()))
            .cloned())
    }

    async fn create_service_account(&self, sa: &ServiceAccount) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state.service_accounts.insert(key_of(&sa.metadata), sa.clone());
        Ok(())
    }

    async fn delete_service_account(&self, key: &NamespacedName) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state
            .service_accounts
            .remove(&(key.namespace.clone(), key.name.clone()));
        Ok(())
    }

    async fn get_role_binding(&self, key: &NamespacedName) -> kube::Result<Option<RoleBinding>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .role_bindings
            .get(&(key.namespace.clone(), key.name.clone()))
            .cloned())
    }

    async fn create_role_binding(&self, rb: &RoleBinding) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state.role_bindings.insert(key_of(&rb.metadata), rb.clone());
        Ok(())
    }

    async fn delete_role_binding(&self, key: &NamespacedName) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations += 1;
        state
            .role_bindings
            .remove(&(key.namespace.clone(), key.name.clone()));
        Ok(())
    }

    async fn publish_event(
        &self,
        _sts: &StatefulSet,
        severity: EventSeverity,
        reason: &str,
        note: &str,
    ) -> kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(RecordedEvent {
            severity,
            reason: reason.to_string(),
            note: note.to_string(),
        });
        Ok(())
    }
}

fn storage_requests(size: &str) -> VolumeResourceRequirements {
    VolumeResourceRequirements {
        requests: Some(BTreeMap::from([(
            "storage".to_string(),
            Quantity(size.to_string()),
        )])),
        ..Default::default()
    }
}

/// A claim like the StatefulSet controller creates for a replica.
pub fn source_pvc(namespace: &str, name: &str, size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(storage_requests(size)),
            volume_mode: Some("Filesystem".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// A StatefulSet with one claim template requesting `size`, converged at
/// `replicas` replicas.
pub fn statefulset(
    namespace: &str,
    name: &str,
    replicas: i32,
    template: &str,
    size: &str,
) -> StatefulSet {
    let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            service_name: name.to_string(),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some("app".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(template.to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    resources: Some(storage_requests(size)),
                    ..Default::default()
                }),
                status: None,
            }]),
            ..Default::default()
        }),
        status: Some(StatefulSetStatus {
            replicas,
            current_revision: Some("rev-1".to_string()),
            ..Default::default()
        }),
    }
}

/// A minimal StatefulSet for exercising the scale state machine.
pub fn statefulset_with_status(replicas: i32, status_replicas: i32, revision: &str) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("ns".to_string()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: Some(StatefulSetStatus {
            replicas: status_replicas,
            current_revision: if revision.is_empty() {
                None
            } else {
                Some(revision.to_string())
            },
            ..Default::default()
        }),
    }
}
