//! Descriptor of a single resizable claim.
//!
//! A [`VolumeInfo`] is created when a claim is found to be smaller than its
//! template and lives, serialized into the plan annotation on the
//! StatefulSet, until both migration phases have succeeded. The backup name
//! it derives is a pure function of the source name and the source size, so
//! every reconcile finds the objects created by earlier ones.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::cluster::NamespacedName;
use crate::naming;

/// Marks claims and jobs created by this controller, so cleanup can never
/// alias user resources.
pub const MANAGED_LABEL: &str = "sts-resize.pikach.us/managed";

const MAX_NAME_LENGTH: usize = 63;
const STORAGE: &str = "storage";

/// One resizable claim, as persisted in the plan annotation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub namespace: String,
    pub source_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub spec: PersistentVolumeClaimSpec,
    pub target_size: Quantity,
    #[serde(default)]
    pub backed_up: bool,
    #[serde(default)]
    pub restored: bool,
}

impl VolumeInfo {
    /// Captures the observed claim together with the size it should grow to.
    pub fn new(pvc: &PersistentVolumeClaim, grow_to: Quantity) -> Self {
        VolumeInfo {
            namespace: pvc.metadata.namespace.clone().unwrap_or_default(),
            source_name: pvc.metadata.name.clone().unwrap_or_default(),
            labels: pvc.metadata.labels.clone().unwrap_or_default(),
            spec: pvc.spec.clone().unwrap_or_default(),
            target_size: grow_to,
            backed_up: false,
            restored: false,
        }
    }

    /// The claim's current storage request.
    pub fn source_size(&self) -> Quantity {
        self.spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get(STORAGE))
            .cloned()
            .unwrap_or_else(|| Quantity("0".to_string()))
    }

    /// Name of the backup claim, a deterministic function of the source name
    /// and the source size string, bounded to 63 characters.
    pub fn backup_name(&self) -> String {
        let suffix = format!("-backup-{}", self.source_size().0);
        let bound = MAX_NAME_LENGTH.saturating_sub(suffix.len());
        let name = naming::shorten_name(&self.source_name, bound)
            .unwrap_or_else(|_| self.source_name.clone());
        format!("{name}{suffix}").to_lowercase()
    }

    pub fn source_key(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.source_name)
    }

    pub fn backup_key(&self) -> NamespacedName {
        NamespacedName::new(&self.namespace, &self.backup_name())
    }

    /// Desired shape of the backup claim: managed, same spec, still at the
    /// source size. It only grows once restored into the recreated original.
    pub fn backup_claim(&self) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.backup_name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    MANAGED_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: self.spec.access_modes.clone(),
                resources: self.spec.resources.clone(),
                storage_class_name: self.spec.storage_class_name.clone(),
                volume_mode: self.spec.volume_mode.clone(),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Desired shape of the recreated original: original name and labels,
    /// original spec except for the storage request, which is the target.
    pub fn resized_source(&self) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(self.source_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: if self.labels.is_empty() {
                    None
                } else {
                    Some(self.labels.clone())
                },
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: self.spec.access_modes.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        STORAGE.to_string(),
                        self.target_size.clone(),
                    )])),
                    ..Default::default()
                }),
                storage_class_name: self.spec.storage_class_name.clone(),
                volume_mode: self.spec.volume_mode.clone(),
                ..Default::default()
            }),
            status: None,
        }
    }
}

/// Storage request of an arbitrary claim, if it has one.
pub fn storage_request(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get(STORAGE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::source_pvc;

    fn info(name: &str, size: &str, target: &str) -> VolumeInfo {
        VolumeInfo::new(&source_pvc("ns", name, size), Quantity(target.to_string()))
    }

    #[test]
    fn backup_name_uses_source_size() {
        let vi = info("data-web-0", "1G", "2G");
        assert_eq!(vi.backup_name(), "data-web-0-backup-1g");
    }

    #[test]
    fn backup_name_is_bounded_and_valid() {
        let long = "a".repeat(80);
        let vi = info(&long, "1500Mi", "2Gi");
        let name = vi.backup_name();
        assert!(name.len() <= 63, "{name:?} too long");
        assert!(
            name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "{name:?} not a DNS-1123 label"
        );
        assert!(name.ends_with("-backup-1500mi"));
    }

    #[test]
    fn backup_name_depends_only_on_source_name_and_size() {
        let a = info("data-web-0", "1Gi", "2Gi");
        let mut b = info("data-web-0", "1Gi", "5Gi");
        b.backed_up = true;
        b.labels.insert("app".into(), "web".into());
        assert_eq!(a.backup_name(), b.backup_name());
    }

    #[test]
    fn backup_claim_keeps_source_size_and_is_managed() {
        let vi = info("data-web-0", "1Gi", "2Gi");
        let backup = vi.backup_claim();
        assert_eq!(backup.metadata.name.as_deref(), Some("data-web-0-backup-1gi"));
        assert_eq!(
            backup.metadata.labels.as_ref().unwrap().get(MANAGED_LABEL),
            Some(&"true".to_string())
        );
        assert_eq!(storage_request(&backup), Some(&Quantity("1Gi".into())));
    }

    #[test]
    fn resized_source_requests_target_size() {
        let mut vi = info("data-web-0", "1Gi", "2Gi");
        vi.labels.insert("app".into(), "web".into());
        let source = vi.resized_source();
        assert_eq!(source.metadata.name.as_deref(), Some("data-web-0"));
        assert_eq!(storage_request(&source), Some(&Quantity("2Gi".into())));
        assert_eq!(
            source.metadata.labels.as_ref().unwrap().get("app"),
            Some(&"web".to_string())
        );
    }

    #[test]
    fn plan_round_trips_through_json() {
        let mut vi = info("data-web-1", "1Gi", "2Gi");
        vi.backed_up = true;
        let plan = vec![vi];
        let encoded = serde_json::to_string(&plan).unwrap();
        let decoded: Vec<VolumeInfo> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, plan);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }
}
