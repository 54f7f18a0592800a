//! Service account provisioning for sync jobs.
//!
//! Some clusters only allow the rsync pod to run (for example as root, or
//! with a privileged pod security policy) under a dedicated ClusterRole. If
//! one is configured, every StatefulSet being resized gets a managed
//! ServiceAccount bound to it; the copy-jobs run under that account and both
//! objects are removed once the resize is done.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;

use crate::cluster::{ClusterApi, NamespacedName};
use crate::errors::ResizeError;
use crate::naming;
use crate::volume::MANAGED_LABEL;

pub const OBJECT_NAME_PREFIX: &str = "sts-resize-sync-job-";

/// Name of both RBAC objects for a StatefulSet, bounded to 63 characters.
pub fn object_name(sts_name: &str) -> String {
    // The bound leaves more than 16 characters for the shortened name, so
    // shortening cannot fail.
    let name = naming::shorten_name(sts_name, 63 - OBJECT_NAME_PREFIX.len())
        .unwrap_or_else(|_| sts_name.to_string());
    format!("{OBJECT_NAME_PREFIX}{name}")
}

/// Ensures the ServiceAccount and RoleBinding for `sts_name` exist and
/// returns the account name the sync jobs should run under. A no-op
/// returning `None` when no ClusterRole is configured.
pub async fn ensure_sync_rbac<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    sts_name: &str,
    cluster_role: Option<&str>,
) -> Result<Option<String>, ResizeError> {
    let Some(role) = cluster_role else {
        return Ok(None);
    };
    let name = object_name(sts_name);
    let key = NamespacedName::new(namespace, &name);

    if cluster.get_service_account(&key).await?.is_none() {
        info!(account = %key, "creating sync job service account");
        cluster
            .create_service_account(&service_account(namespace, &name))
            .await?;
    }
    if cluster.get_role_binding(&key).await?.is_none() {
        cluster
            .create_role_binding(&role_binding(namespace, &name, role))
            .await?;
    }
    Ok(Some(name))
}

/// Removes the RBAC objects created by [`ensure_sync_rbac`].
pub async fn cleanup_sync_rbac<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    sts_name: &str,
    cluster_role: Option<&str>,
) -> Result<(), ResizeError> {
    if cluster_role.is_none() {
        return Ok(());
    }
    let key = NamespacedName::new(namespace, &object_name(sts_name));
    cluster.delete_role_binding(&key).await?;
    cluster.delete_service_account(&key).await?;
    Ok(())
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])
}

fn service_account(namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn role_binding(namespace: &str, name: &str, cluster_role: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeCluster;

    #[test]
    fn object_name_is_bounded() {
        let name = object_name(&"web".repeat(40));
        assert!(name.len() <= 63, "{name:?} too long");
        assert!(name.starts_with(OBJECT_NAME_PREFIX));
        assert_eq!(name, object_name(&"web".repeat(40)));
    }

    #[tokio::test]
    async fn no_cluster_role_means_no_objects() {
        let cluster = FakeCluster::new();
        let sa = ensure_sync_rbac(&cluster, "ns", "web", None).await.unwrap();
        assert_eq!(sa, None);
        assert!(cluster.service_accounts().is_empty());
    }

    #[tokio::test]
    async fn creates_both_objects_idempotently() {
        let cluster = FakeCluster::new();

        let sa = ensure_sync_rbac(&cluster, "ns", "web", Some("sync-role"))
            .await
            .unwrap();
        assert_eq!(sa.as_deref(), Some("sts-resize-sync-job-web"));
        ensure_sync_rbac(&cluster, "ns", "web", Some("sync-role"))
            .await
            .unwrap();

        assert_eq!(cluster.service_accounts().len(), 1);
        let bindings = cluster.role_bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].role_ref.name, "sync-role");
        assert_eq!(
            bindings[0].subjects.as_ref().unwrap()[0].name,
            "sts-resize-sync-job-web"
        );
    }

    #[tokio::test]
    async fn cleanup_removes_both_objects() {
        let cluster = FakeCluster::new();
        ensure_sync_rbac(&cluster, "ns", "web", Some("sync-role"))
            .await
            .unwrap();

        cleanup_sync_rbac(&cluster, "ns", "web", Some("sync-role"))
            .await
            .unwrap();

        assert!(cluster.service_accounts().is_empty());
        assert!(cluster.role_bindings().is_empty());
    }
}
