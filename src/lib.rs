//! Resizes the PersistentVolumeClaims of StatefulSets.
//!
//! StatefulSet volume claim templates are immutable, so growing a template
//! means migrating data. On observing a claim smaller than its template this
//! controller scales the set to zero, copies each undersized claim into a
//! same-size backup claim, recreates the original at the new size, copies the
//! data back and restores the original replica count. Every step is
//! idempotent and resumable: all in-flight state lives in annotations on the
//! StatefulSet and on the auxiliary objects, and auxiliary objects are
//! re-found by deterministic names.
//!
//! For storage classes with native volume expansion the [`inplace`] mode
//! skips the whole dance and raises the claims' requests directly.

pub mod backup;
pub mod cluster;
pub mod controller;
pub mod errors;
pub mod inplace;
pub mod naming;
pub mod quantity;
pub mod rbac;
pub mod resize;
pub mod restore;
pub mod statefulset;
pub mod sync;
pub mod test_support;
pub mod volume;
