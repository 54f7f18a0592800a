//! Discovery of undersized claims and the per-volume orchestrator.
//!
//! Discovery matches claims against the StatefulSet's claim templates by the
//! `<template>-<set>-<ordinal>` naming contract, so unrelated claims that
//! merely share labels or a name prefix are never touched. The orchestrator
//! sequences Backup before Restore for one volume and decides, for each
//! failure, whether scaling the workload back up is still safe.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::trace;

use crate::backup;
use crate::cluster::ClusterApi;
use crate::errors::{Progress, ResizeError};
use crate::quantity;
use crate::restore;
use crate::volume::{storage_request, VolumeInfo};

/// Lists the claims selected by the StatefulSet and keeps those that belong
/// to one of its templates and are strictly smaller than it.
pub async fn fetch_resizable<C: ClusterApi>(
    cluster: &C,
    sts: &StatefulSet,
) -> Result<Vec<VolumeInfo>, ResizeError> {
    let namespace = sts.metadata.namespace.as_deref().unwrap_or_default();
    let selector = sts
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.clone())
        .unwrap_or_default();
    let claims = cluster.list_claims(namespace, &selector).await?;
    Ok(filter_resizable(sts, &claims))
}

/// Pure part of discovery; the first matching template wins.
pub fn filter_resizable(sts: &StatefulSet, claims: &[PersistentVolumeClaim]) -> Vec<VolumeInfo> {
    let Some(spec) = sts.spec.as_ref() else {
        return Vec::new();
    };
    let templates = spec.volume_claim_templates.as_deref().unwrap_or_default();
    let sts_name = sts.metadata.name.as_deref().unwrap_or_default();
    let sts_namespace = sts.metadata.namespace.as_deref().unwrap_or_default();

    let mut res = Vec::new();
    for claim in claims {
        if claim.metadata.namespace.as_deref() != Some(sts_namespace) {
            continue;
        }
        for template in templates {
            if let Some(target) = claim_below_template(claim, template, sts_name) {
                res.push(VolumeInfo::new(claim, target.clone()));
                break;
            }
        }
    }
    res
}

// Claims materialized from a template are named <template>-<set>-<ordinal>.
// Returns the template's requested size when the claim matches that contract
// and requests strictly less.
fn claim_below_template<'a>(
    claim: &PersistentVolumeClaim,
    template: &'a PersistentVolumeClaim,
    sts_name: &str,
) -> Option<&'a Quantity> {
    let name = claim.metadata.name.as_deref().unwrap_or_default();
    let template_name = template.metadata.name.as_deref().unwrap_or_default();
    let rest = name.strip_prefix(&format!("{template_name}-"))?;
    let ordinal = rest.strip_prefix(&format!("{sts_name}-"))?;
    if ordinal.parse::<u64>().is_err() {
        trace!(claim = name, "claim does not end in an ordinal");
        return None;
    }
    let have = storage_request(claim)?;
    let want = storage_request(template)?;
    match quantity::lt(have, want) {
        Ok(true) => Some(want),
        Ok(false) => None,
        Err(e) => {
            trace!(claim = name, error = %e, "unreadable storage request");
            None
        }
    }
}

/// Sequences Backup then Restore for one volume.
///
/// Terminal failures during Backup become an [`ResizeError::Abort`]: nothing
/// destructive has happened and the workload may be scaled back up. Terminal
/// failures during Restore stay Critical, since the original claim may
/// already be gone.
pub async fn resize_volume<C: ClusterApi>(
    cluster: &C,
    image: &str,
    service_account: Option<&str>,
    vol: &mut VolumeInfo,
) -> Result<Progress, ResizeError> {
    match backup::backup(cluster, image, service_account, vol).await {
        Ok(Progress::Done) => {}
        Ok(Progress::InProgress) => return Ok(Progress::InProgress),
        Err(e) if e.is_terminal() => {
            return Err(ResizeError::Abort(format!(
                "Failed to backup {}: {e}",
                vol.source_name
            )))
        }
        Err(e) => return Err(e),
    }
    restore::restore(cluster, image, service_account, vol).await
}

/// Runs the orchestrator over every pending volume, removing the completed
/// ones from `volumes`. Short-circuits on the first error, leaving the
/// remainder pending.
pub async fn resize_volumes<C: ClusterApi>(
    cluster: &C,
    image: &str,
    service_account: Option<&str>,
    volumes: &mut Vec<VolumeInfo>,
) -> Result<Progress, ResizeError> {
    let mut iter = std::mem::take(volumes).into_iter();
    while let Some(mut vol) = iter.next() {
        match resize_volume(cluster, image, service_account, &mut vol).await {
            Ok(Progress::Done) => {}
            Ok(Progress::InProgress) => volumes.push(vol),
            Err(e) => {
                volumes.push(vol);
                volumes.extend(iter);
                return Err(e);
            }
        }
    }
    Ok(if volumes.is_empty() {
        Progress::Done
    } else {
        Progress::InProgress
    })
}
