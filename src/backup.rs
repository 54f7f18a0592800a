//! Backup step: stage the claim's data into a same-size sibling.
//!
//! Idempotent across crashes at any point. The descriptor flag short-cuts
//! completed work within a plan; the `done` annotation on the backup claim
//! does the same across controller restarts, after the copy-job that would
//! prove completion has already been deleted.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::errors::{Progress, ResizeError};
use crate::quantity;
use crate::sync;
use crate::volume::{storage_request, VolumeInfo};

/// Set on a backup claim once its copy has succeeded.
pub const DONE_ANNOTATION: &str = "sts-resize.pikach.us/done";

/// Moves the backup of `vol` one observation forward.
pub async fn backup<C: ClusterApi>(
    cluster: &C,
    image: &str,
    service_account: Option<&str>,
    vol: &mut VolumeInfo,
) -> Result<Progress, ResizeError> {
    if vol.backed_up {
        return Ok(Progress::Done);
    }

    let source_key = vol.source_key();
    let Some(original) = cluster.get_claim(&source_key).await? else {
        return Err(ResizeError::Critical(format!(
            "original claim {source_key} missing while trying to back it up"
        )));
    };

    let backup = get_or_create_claim(cluster, vol.backup_claim()).await?;
    if is_done(&backup) {
        debug!(claim = %vol.backup_key(), "backup already marked done");
        vol.backed_up = true;
        return Ok(Progress::Done);
    }

    // A same-name claim someone else created may be too small to hold the
    // data; refuse to treat it as our backup.
    if let (Some(have), Some(need)) = (storage_request(&backup), storage_request(&original)) {
        if quantity::lt(have, need)
            .map_err(|e| ResizeError::Abort(format!("existing backup {} unusable: {e}", vol.backup_name())))?
        {
            return Err(ResizeError::Abort(format!(
                "existing backup {} too small",
                vol.backup_name()
            )));
        }
    }

    match sync::sync_volume(cluster, image, service_account, &source_key, &vol.backup_key()).await? {
        Progress::InProgress => Ok(Progress::InProgress),
        Progress::Done => {
            mark_done(cluster, backup).await?;
            info!(claim = %source_key, backup = %vol.backup_name(), "backup complete");
            vol.backed_up = true;
            Ok(Progress::Done)
        }
    }
}

async fn get_or_create_claim<C: ClusterApi>(
    cluster: &C,
    desired: PersistentVolumeClaim,
) -> Result<PersistentVolumeClaim, ResizeError> {
    let key = crate::cluster::NamespacedName::new(
        desired.metadata.namespace.as_deref().unwrap_or_default(),
        desired.metadata.name.as_deref().unwrap_or_default(),
    );
    match cluster.get_claim(&key).await? {
        Some(found) => Ok(found),
        None => {
            info!(claim = %key, "creating backup claim");
            cluster.create_claim(&desired).await?;
            Ok(desired)
        }
    }
}

fn is_done(claim: &PersistentVolumeClaim) -> bool {
    claim
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DONE_ANNOTATION))
        .is_some_and(|v| v == "true")
}

async fn mark_done<C: ClusterApi>(
    cluster: &C,
    mut claim: PersistentVolumeClaim,
) -> Result<(), ResizeError> {
    claim
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(DONE_ANNOTATION.to_string(), "true".to_string());
    cluster.update_claim(&claim).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::job_name;
    use crate::test_support::{source_pvc, FakeCluster};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn vol(cluster: &FakeCluster) -> VolumeInfo {
        let pvc = source_pvc("ns", "data-web-0", "1Gi");
        cluster.put_claim(pvc.clone());
        VolumeInfo::new(&pvc, Quantity("2Gi".into()))
    }

    #[tokio::test]
    async fn creates_backup_claim_and_starts_copy() {
        let cluster = FakeCluster::new();
        let mut v = vol(&cluster);

        let res = backup(&cluster, "img", None, &mut v).await.unwrap();

        assert_eq!(res, Progress::InProgress);
        let b = cluster.claim("ns", &v.backup_name()).expect("backup claim created");
        assert_eq!(storage_request(&b), Some(&Quantity("1Gi".into())));
        assert_eq!(cluster.jobs().len(), 1);
        assert!(!v.backed_up);
    }

    #[tokio::test]
    async fn finishes_after_copy_succeeds() {
        let cluster = FakeCluster::new();
        let mut v = vol(&cluster);

        backup(&cluster, "img", None, &mut v).await.unwrap();
        cluster.complete_job("ns", &job_name("data-web-0", &v.backup_name()));

        let res = backup(&cluster, "img", None, &mut v).await.unwrap();
        assert_eq!(res, Progress::Done);
        assert!(v.backed_up);
        assert!(cluster.jobs().is_empty());
        let b = cluster.claim("ns", &v.backup_name()).unwrap();
        assert!(is_done(&b), "backup claim must carry the done annotation");
    }

    #[tokio::test]
    async fn descriptor_flag_short_circuits() {
        let cluster = FakeCluster::new();
        let mut v = vol(&cluster);
        v.backed_up = true;

        let res = backup(&cluster, "img", None, &mut v).await.unwrap();
        assert_eq!(res, Progress::Done);
        assert!(cluster.jobs().is_empty());
        assert!(cluster.claim("ns", &v.backup_name()).is_none());
    }

    #[tokio::test]
    async fn done_annotation_survives_restart() {
        // Controller restarted after the copy finished and the job was
        // deleted, but before the descriptor flag was persisted.
        let cluster = FakeCluster::new();
        let mut v = vol(&cluster);
        let mut b = v.backup_claim();
        b.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(DONE_ANNOTATION.to_string(), "true".to_string());
        cluster.put_claim(b);

        let res = backup(&cluster, "img", None, &mut v).await.unwrap();
        assert_eq!(res, Progress::Done);
        assert!(v.backed_up);
        assert!(cluster.jobs().is_empty(), "no new copy may start");
    }

    #[tokio::test]
    async fn missing_original_is_critical() {
        let cluster = FakeCluster::new();
        let pvc = source_pvc("ns", "data-web-0", "1Gi");
        let mut v = VolumeInfo::new(&pvc, Quantity("2Gi".into()));

        let res = backup(&cluster, "img", None, &mut v).await;
        assert!(matches!(res, Err(ResizeError::Critical(_))));
    }

    #[tokio::test]
    async fn foreign_undersized_backup_aborts() {
        let cluster = FakeCluster::new();
        let mut v = vol(&cluster);
        cluster.put_claim(source_pvc("ns", &v.backup_name(), "500Mi"));

        let res = backup(&cluster, "img", None, &mut v).await;
        match res {
            Err(ResizeError::Abort(msg)) => assert!(msg.contains("too small"), "{msg}"),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_copy_surfaces_as_critical() {
        let cluster = FakeCluster::new();
        let mut v = vol(&cluster);

        backup(&cluster, "img", None, &mut v).await.unwrap();
        cluster.fail_job("ns", &job_name("data-web-0", &v.backup_name()));

        let res = backup(&cluster, "img", None, &mut v).await;
        assert!(matches!(res, Err(ResizeError::Critical(_))));
        assert!(!v.backed_up);
    }
}
