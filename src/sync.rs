//! The copy-job engine.
//!
//! Data moves between two claims through a one-shot Job that mounts the
//! source at `/src`, the destination at `/dst` and runs rsync preserving
//! attributes. The job name is a pure function of the two claim names, so a
//! later reconcile finds the job an earlier one created instead of starting
//! a second copy.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::cluster::{ClusterApi, NamespacedName};
use crate::errors::{Progress, ResizeError};
use crate::naming;
use crate::volume::MANAGED_LABEL;

const SYNC_COMMAND: &[&str] = &[
    "rsync",
    "-avhWHAX",
    "--no-compress",
    "--progress",
    "/src/",
    "/dst/",
];

// Claim names are at most 63 characters; 27 per side keeps
// "sync-<src>-to-<dst>" within the 63-character job name limit.
const NAME_PART_LENGTH: usize = 27;

/// Name of the job copying `src` to `dst`. Deterministic so that repeated
/// reconciles converge on the same job.
pub fn job_name(src: &str, dst: &str) -> String {
    let src = naming::shorten_name(src, NAME_PART_LENGTH).unwrap_or_else(|_| src.to_string());
    let dst = naming::shorten_name(dst, NAME_PART_LENGTH).unwrap_or_else(|_| dst.to_string());
    format!("sync-{src}-to-{dst}").to_lowercase()
}

/// The one-shot rsync job between two claims in `namespace`.
pub fn build_job(
    namespace: &str,
    image: &str,
    service_account: Option<&str>,
    src: &str,
    dst: &str,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(job_name(src, dst)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "sync".to_string(),
                        image: Some(image.to_string()),
                        command: Some(SYNC_COMMAND.iter().map(|s| s.to_string()).collect()),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                mount_path: "/src".to_string(),
                                name: "src".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                mount_path: "/dst".to_string(),
                                name: "dst".to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    restart_policy: Some("OnFailure".to_string()),
                    service_account_name: service_account.map(str::to_string),
                    volumes: Some(vec![
                        Volume {
                            name: "src".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: src.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "dst".to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: dst.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Drives the copy from `src` to `dst` one observation forward.
///
/// Gets or creates the job, then interprets its conditions: a completed job
/// is deleted with foreground propagation (its pods must release the claims
/// before they can be mounted again) and reports `Done`; a failed job is
/// terminal for this volume and surfaces as Critical; anything else is still
/// in progress.
pub async fn sync_volume<C: ClusterApi>(
    cluster: &C,
    image: &str,
    service_account: Option<&str>,
    src: &NamespacedName,
    dst: &NamespacedName,
) -> Result<Progress, ResizeError> {
    if src.namespace != dst.namespace {
        return Err(ResizeError::Critical(format!(
            "unable to copy {src} to {dst} across namespaces"
        )));
    }

    let key = NamespacedName::new(&src.namespace, &job_name(&src.name, &dst.name));
    let job = match cluster.get_job(&key).await? {
        Some(found) => found,
        None => {
            let job = build_job(&src.namespace, image, service_account, &src.name, &dst.name);
            info!(job = %key, %src, %dst, "starting sync job");
            cluster.create_job(&job).await?;
            job
        }
    };

    if has_condition(&job, "Failed") {
        return Err(ResizeError::Critical(format!("sync job {key} failed")));
    }
    if has_condition(&job, "Complete") {
        // Clean up right away so the destination can be mounted next.
        debug!(job = %key, "sync job complete, cleaning up");
        cluster.delete_job(&key).await?;
        return Ok(Progress::Done);
    }
    Ok(Progress::InProgress)
}

fn has_condition(job: &Job, kind: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == kind && c.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCluster;

    #[test]
    fn job_name_is_deterministic_and_bounded() {
        let src = "data-a-very-long-statefulset-name-for-testing-0";
        let dst = "data-a-very-long-statefulset-name-for-testing-0-backup-1gi";
        let name = job_name(src, dst);
        assert_eq!(name, job_name(src, dst));
        assert!(name.len() <= 63, "{name:?} too long");
        assert!(name.starts_with("sync-"));
        assert!(name.contains("-to-"));
    }

    #[test]
    fn short_names_stay_readable() {
        assert_eq!(
            job_name("data-web-0", "data-web-0-backup-1g"),
            "sync-data-web-0-to-data-web-0-backup-1g"
        );
    }

    #[test]
    fn job_shape() {
        let job = build_job("ns", "rsync-image", Some("sync-sa"), "src-claim", "dst-claim");
        let spec = job.spec.as_ref().unwrap();
        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        assert_eq!(pod.service_account_name.as_deref(), Some("sync-sa"));
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("rsync-image"));
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec![
                "rsync".to_string(),
                "-avhWHAX".to_string(),
                "--no-compress".to_string(),
                "--progress".to_string(),
                "/src/".to_string(),
                "/dst/".to_string(),
            ]
        );
        let volumes = pod.volumes.as_ref().unwrap();
        let claims: Vec<_> = volumes
            .iter()
            .map(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .map(|p| p.claim_name.as_str())
                    .unwrap()
            })
            .collect();
        assert_eq!(claims, vec!["src-claim", "dst-claim"]);
        assert_eq!(
            job.metadata.labels.as_ref().unwrap().get(MANAGED_LABEL),
            Some(&"true".to_string())
        );
    }

    #[tokio::test]
    async fn cross_namespace_copy_is_critical() {
        let cluster = FakeCluster::new();
        let res = sync_volume(
            &cluster,
            "img",
            None,
            &NamespacedName::new("a", "src"),
            &NamespacedName::new("b", "dst"),
        )
        .await;
        assert!(matches!(res, Err(ResizeError::Critical(_))));
    }

    #[tokio::test]
    async fn creates_job_once_and_reports_in_progress() {
        let cluster = FakeCluster::new();
        let src = NamespacedName::new("ns", "data-web-0");
        let dst = NamespacedName::new("ns", "data-web-0-backup-1g");

        let first = sync_volume(&cluster, "img", None, &src, &dst).await.unwrap();
        assert_eq!(first, Progress::InProgress);
        assert_eq!(cluster.jobs().len(), 1);

        let second = sync_volume(&cluster, "img", None, &src, &dst).await.unwrap();
        assert_eq!(second, Progress::InProgress);
        assert_eq!(cluster.jobs().len(), 1, "second reconcile must reuse the job");
    }

    #[tokio::test]
    async fn completed_job_is_deleted_and_done() {
        let cluster = FakeCluster::new();
        let src = NamespacedName::new("ns", "data-web-0");
        let dst = NamespacedName::new("ns", "data-web-0-backup-1g");

        sync_volume(&cluster, "img", None, &src, &dst).await.unwrap();
        cluster.complete_job("ns", &job_name(&src.name, &dst.name));

        let res = sync_volume(&cluster, "img", None, &src, &dst).await.unwrap();
        assert_eq!(res, Progress::Done);
        assert!(cluster.jobs().is_empty(), "completed job must be removed");
    }

    #[tokio::test]
    async fn failed_job_is_critical() {
        let cluster = FakeCluster::new();
        let src = NamespacedName::new("ns", "data-web-0");
        let dst = NamespacedName::new("ns", "data-web-0-backup-1g");

        sync_volume(&cluster, "img", None, &src, &dst).await.unwrap();
        cluster.fail_job("ns", &job_name(&src.name, &dst.name));

        let res = sync_volume(&cluster, "img", None, &src, &dst).await;
        match res {
            Err(ResizeError::Critical(msg)) => assert!(msg.contains("failed"), "{msg}"),
            other => panic!("expected critical error, got {other:?}"),
        }
    }
}
