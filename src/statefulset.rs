//! Wrapper around the observed StatefulSet.
//!
//! Keeps the object as observed (for diffing at commit time) next to a
//! mutable clone, and owns every piece of state the engine persists on it:
//! the serialized plan of pending volumes, the saved replica count, the
//! scale-up marker and the failed label.

use k8s_openapi::api::apps::v1::StatefulSet;

use crate::errors::ResizeError;
use crate::volume::VolumeInfo;

/// Marks a StatefulSet whose resize failed terminally; the engine ignores it.
pub const FAILED_LABEL: &str = "sts-resize.pikach.us/failed";
/// Carries the JSON-encoded plan of volumes still to be migrated.
pub const PVC_ANNOTATION: &str = "sts-resize.pikach.us/pvcs";
/// Stores the replica count observed before quiescing.
pub const REPLICAS_ANNOTATION: &str = "sts-resize.pikach.us/replicas";
/// Marks a scale-up in progress; suppresses any further scale-down.
pub const SCALUP_ANNOTATION: &str = "sts-resize.pikach.us/scalup";

/// All data needed to drive one StatefulSet through a resize.
#[derive(Clone, Debug)]
pub struct StatefulSetInfo {
    /// The object as observed, untouched, for the commit diff.
    pub old: StatefulSet,
    /// Volumes still to be migrated.
    pub volumes: Vec<VolumeInfo>,

    sts: StatefulSet,
    had_plan: bool,
    plan_cleared: bool,
}

impl StatefulSetInfo {
    /// Wraps the observed StatefulSet and decodes the persisted plan, if any.
    pub fn new(sts: &StatefulSet) -> Result<Self, ResizeError> {
        let mut info = Self::without_plan(sts);
        if let Some(raw) = annotation(sts, PVC_ANNOTATION) {
            info.volumes =
                serde_json::from_str(raw).map_err(|e| ResizeError::Plan {
                    annotation: PVC_ANNOTATION.to_string(),
                    reason: e.to_string(),
                })?;
            info.had_plan = true;
        }
        Ok(info)
    }

    /// Wraps the observed StatefulSet ignoring any persisted plan. Used to
    /// mark an object failed when its plan annotation is unreadable.
    pub fn without_plan(sts: &StatefulSet) -> Self {
        StatefulSetInfo {
            old: sts.clone(),
            volumes: Vec::new(),
            sts: sts.clone(),
            had_plan: false,
            plan_cleared: false,
        }
    }

    pub fn name(&self) -> &str {
        self.sts.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.sts.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The StatefulSet with the current plan serialized back into its
    /// annotation, ready to be written.
    pub fn statefulset(&self) -> Result<StatefulSet, ResizeError> {
        let mut sts = self.sts.clone();
        let annotations = sts.metadata.annotations.get_or_insert_with(Default::default);
        if self.plan_cleared {
            annotations.remove(PVC_ANNOTATION);
        } else if self.had_plan || !self.volumes.is_empty() {
            let encoded = serde_json::to_string(&self.volumes)
                .map_err(|e| ResizeError::Critical(format!("unable to encode plan: {e}")))?;
            annotations.insert(PVC_ANNOTATION.to_string(), encoded);
        }
        if annotations.is_empty() {
            sts.metadata.annotations = None;
        }
        Ok(sts)
    }

    /// Whether the plan annotation was present on the observed object.
    pub fn had_plan(&self) -> bool {
        self.had_plan
    }

    /// Drops the plan annotation. Called once the resize is complete, or to
    /// clean up an empty leftover plan.
    pub fn clear_plan(&mut self) {
        self.volumes.clear();
        self.plan_cleared = true;
    }

    /// True iff volumes are still pending migration.
    pub fn resizing(&self) -> bool {
        !self.volumes.is_empty()
    }

    /// True iff a previous resize of this StatefulSet failed terminally.
    pub fn failed(&self) -> bool {
        label(&self.sts, FAILED_LABEL) == Some("true")
    }

    pub fn set_failed(&mut self) {
        self.sts
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(FAILED_LABEL.to_string(), "true".to_string());
    }

    /// True iff a quiesce happened and the scale-up has not completed: the
    /// saved replica count or the scale-up marker is still present.
    pub fn resuming(&self) -> bool {
        annotation(&self.sts, REPLICAS_ANNOTATION).is_some() || self.is_scaling_up()
    }

    /// Moves the StatefulSet towards zero replicas. Returns true when it is
    /// fully quiesced (or a scale-up is in progress and must not be undone);
    /// false means the desired state changed or has not converged yet.
    pub fn prepare_scale_down(&mut self) -> bool {
        if self.is_scaled_down() || self.is_scaling_up() {
            return true;
        }
        let current = self.desired_replicas().unwrap_or(1);
        let annotations = self
            .sts
            .metadata
            .annotations
            .get_or_insert_with(Default::default);
        annotations
            .entry(REPLICAS_ANNOTATION.to_string())
            .or_insert_with(|| current.to_string());
        self.set_desired_replicas(0);
        false
    }

    /// Moves the StatefulSet back to its saved replica count. Returns true
    /// when the scale-up has converged, after clearing the saved count and
    /// the scale-up marker. Fails if the saved count is unreadable.
    pub fn prepare_scale_up(&mut self) -> Result<bool, ResizeError> {
        let raw = annotation(&self.sts, REPLICAS_ANNOTATION)
            .unwrap_or_default()
            .to_string();
        let scale: i32 = raw.parse().map_err(|_| ResizeError::Plan {
            annotation: REPLICAS_ANNOTATION.to_string(),
            reason: format!("{raw:?} is not a replica count"),
        })?;
        if self.is_scaled_up(scale) {
            if let Some(annotations) = self.sts.metadata.annotations.as_mut() {
                annotations.remove(REPLICAS_ANNOTATION);
                annotations.remove(SCALUP_ANNOTATION);
            }
            return Ok(true);
        }
        self.sts
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(SCALUP_ANNOTATION.to_string(), "true".to_string());
        self.set_desired_replicas(scale);
        Ok(false)
    }

    fn desired_replicas(&self) -> Option<i32> {
        self.sts.spec.as_ref().and_then(|s| s.replicas)
    }

    fn set_desired_replicas(&mut self, n: i32) {
        self.sts.spec.get_or_insert_with(Default::default).replicas = Some(n);
    }

    // A non-empty CurrentRevision proves the StatefulSet controller has run
    // since our write; observed replicas alone may be stale.
    fn is_scaled_down(&self) -> bool {
        self.desired_replicas() == Some(0) && self.observed_converged(0)
    }

    fn is_scaled_up(&self, scale: i32) -> bool {
        self.desired_replicas() == Some(scale) && self.observed_converged(scale)
    }

    fn observed_converged(&self, scale: i32) -> bool {
        self.sts.status.as_ref().is_some_and(|st| {
            st.replicas == scale
                && st
                    .current_revision
                    .as_deref()
                    .is_some_and(|r| !r.is_empty())
        })
    }

    fn is_scaling_up(&self) -> bool {
        annotation(&self.sts, SCALUP_ANNOTATION) == Some("true")
    }
}

fn annotation<'a>(sts: &'a StatefulSet, key: &str) -> Option<&'a str> {
    sts.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

fn label<'a>(sts: &'a StatefulSet, key: &str) -> Option<&'a str> {
    sts.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}
