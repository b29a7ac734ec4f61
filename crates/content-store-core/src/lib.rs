//! Core types and traits for the game content store.
//!
//! This crate defines what the filesystem store and its collaborators share:
//! - `ContentType`, `EntityKey`, `Entity`: the content model
//! - `PathLock`: per-path FIFO mutex serializing writes to one file
//! - `MirrorBackend`: best-effort secondary storage
//! - `MasterDocument` and sync reports: bulk fan-out of editor documents

mod entity;
mod error;
mod lock;
mod mirror;
mod sync;

pub use entity::{ContentType, Entity, EntityKey, KeyedEntity, LevelEntity};
pub use error::StoreError;
pub use lock::{PathLock, PathLockGuard};
pub use mirror::{mirror_record_key, MirrorBackend, NoopMirror};
pub use sync::{
    ElementFailure, MasterDocument, SyncAllReport, SyncReport, TypeSyncOutcome, DEFAULTS_FIELD,
};
