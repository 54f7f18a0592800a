//! Restore step: recreate the original claim at the target size and copy the
//! staged data back into it.
//!
//! The destructive half of the migration. It only ever runs once the backup
//! phase reported success, and it refuses to proceed when the backup claim
//! has gone missing, because at that point neither copy of the data may
//! exist.

use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::errors::{Progress, ResizeError};
use crate::quantity;
use crate::sync;
use crate::volume::{storage_request, VolumeInfo};

/// Moves the restore of `vol` one observation forward.
pub async fn restore<C: ClusterApi>(
    cluster: &C,
    image: &str,
    service_account: Option<&str>,
    vol: &mut VolumeInfo,
) -> Result<Progress, ResizeError> {
    if vol.restored {
        return Ok(Progress::Done);
    }

    let backup_key = vol.backup_key();
    if cluster.get_claim(&backup_key).await?.is_none() {
        return Err(ResizeError::Critical(format!(
            "backup claim {backup_key} missing while trying to restore"
        )));
    }

    if resize_source(cluster, vol).await? == Progress::InProgress {
        return Ok(Progress::InProgress);
    }

    match sync::sync_volume(cluster, image, service_account, &backup_key, &vol.source_key()).await? {
        Progress::InProgress => Ok(Progress::InProgress),
        Progress::Done => {
            info!(claim = %vol.source_key(), "restore complete");
            vol.restored = true;
            Ok(Progress::Done)
        }
    }
}

// Ensures the original claim exists at the target size. Deleting an
// undersized claim may take a while to become visible; until the claim is
// gone and recreated larger this keeps reporting in-progress rather than
// treating the stale object as an error.
async fn resize_source<C: ClusterApi>(
    cluster: &C,
    vol: &VolumeInfo,
) -> Result<Progress, ResizeError> {
    let source_key = vol.source_key();
    let Some(found) = cluster.get_claim(&source_key).await? else {
        info!(claim = %source_key, size = %vol.target_size.0, "recreating claim at target size");
        cluster.create_claim(&vol.resized_source()).await?;
        return Ok(Progress::InProgress);
    };

    let too_small = match storage_request(&found) {
        Some(size) => quantity::lt(size, &vol.target_size)
            .map_err(|e| ResizeError::Critical(format!("claim {source_key} unusable: {e}")))?,
        None => true,
    };
    if too_small {
        debug!(claim = %source_key, "deleting undersized claim");
        cluster.delete_claim(&source_key).await?;
        return Ok(Progress::InProgress);
    }
    Ok(Progress::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::job_name;
    use crate::test_support::{source_pvc, FakeCluster};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn backed_up_vol(cluster: &FakeCluster) -> VolumeInfo {
        let pvc = source_pvc("ns", "data-web-0", "1Gi");
        cluster.put_claim(pvc.clone());
        let mut v = VolumeInfo::new(&pvc, Quantity("2Gi".into()));
        v.backed_up = true;
        cluster.put_claim(v.backup_claim());
        v
    }

    #[tokio::test]
    async fn deletes_undersized_original_then_recreates_larger() {
        let cluster = FakeCluster::new();
        let mut v = backed_up_vol(&cluster);

        // First pass deletes the undersized claim.
        let res = restore(&cluster, "img", None, &mut v).await.unwrap();
        assert_eq!(res, Progress::InProgress);
        assert!(cluster.claim("ns", "data-web-0").is_none());
        assert!(cluster.jobs().is_empty(), "no copy before the claim is recreated");

        // Second pass recreates it at the target size.
        let res = restore(&cluster, "img", None, &mut v).await.unwrap();
        assert_eq!(res, Progress::InProgress);
        let recreated = cluster.claim("ns", "data-web-0").unwrap();
        assert_eq!(storage_request(&recreated), Some(&Quantity("2Gi".into())));

        // Third pass starts the copy back.
        let res = restore(&cluster, "img", None, &mut v).await.unwrap();
        assert_eq!(res, Progress::InProgress);
        assert_eq!(cluster.jobs().len(), 1);
    }

    #[tokio::test]
    async fn finishes_after_copy_back_succeeds() {
        let cluster = FakeCluster::new();
        let mut v = backed_up_vol(&cluster);
        cluster.put_claim(v.resized_source());

        restore(&cluster, "img", None, &mut v).await.unwrap();
        cluster.complete_job("ns", &job_name(&v.backup_name(), "data-web-0"));

        let res = restore(&cluster, "img", None, &mut v).await.unwrap();
        assert_eq!(res, Progress::Done);
        assert!(v.restored);
        assert!(cluster.jobs().is_empty());
    }

    #[tokio::test]
    async fn descriptor_flag_short_circuits() {
        let cluster = FakeCluster::new();
        let mut v = backed_up_vol(&cluster);
        v.restored = true;

        let res = restore(&cluster, "img", None, &mut v).await.unwrap();
        assert_eq!(res, Progress::Done);
        assert!(cluster.jobs().is_empty());
    }

    #[tokio::test]
    async fn missing_backup_is_critical() {
        let cluster = FakeCluster::new();
        let pvc = source_pvc("ns", "data-web-1", "1Gi");
        let mut v = VolumeInfo::new(&pvc, Quantity("2Gi".into()));
        v.backed_up = true;

        let res = restore(&cluster, "img", None, &mut v).await;
        match res {
            Err(ResizeError::Critical(msg)) => assert!(msg.contains("missing"), "{msg}"),
            other => panic!("expected critical, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_enough_original_is_left_alone() {
        let cluster = FakeCluster::new();
        let mut v = backed_up_vol(&cluster);
        cluster.put_claim(source_pvc("ns", "data-web-0", "3Gi"));

        restore(&cluster, "img", None, &mut v).await.unwrap();
        let kept = cluster.claim("ns", "data-web-0").unwrap();
        assert_eq!(storage_request(&kept), Some(&Quantity("3Gi".into())));
        assert_eq!(cluster.jobs().len(), 1, "copy starts against the existing claim");
    }

    #[tokio::test]
    async fn failed_copy_back_stays_critical() {
        let cluster = FakeCluster::new();
        let mut v = backed_up_vol(&cluster);
        cluster.put_claim(v.resized_source());

        restore(&cluster, "img", None, &mut v).await.unwrap();
        cluster.fail_job("ns", &job_name(&v.backup_name(), "data-web-0"));

        let res = restore(&cluster, "img", None, &mut v).await;
        assert!(matches!(res, Err(ResizeError::Critical(_))));
        assert!(!v.restored);
    }
}
