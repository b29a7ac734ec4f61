//! Filesystem content store for the tap game.
//!
//! One JSON file per entity, a per-type in-memory cache, best-effort mirroring
//! into a secondary store, fan-out from editor master documents, and templates
//! for new entities and players. [`ContentRegistry`] wires it all together.

pub mod config;
mod defaults;
mod mirror;
mod registry;
mod store;
mod sync;

pub use defaults::{repair_fields, DefaultsProvider, NewPlayer, PLAYER_MASTER_FILE};
pub use mirror::NoopMirror;
#[cfg(feature = "cloud")]
pub use mirror::KvMirror;
pub use registry::ContentRegistry;
pub use store::{ContentStore, StoreOptions, DEFAULT_MIRROR_TIMEOUT};
pub use sync::MasterSyncService;
