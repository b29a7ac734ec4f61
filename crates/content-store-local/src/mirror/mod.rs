pub use content_store_core::NoopMirror;

#[cfg(feature = "cloud")]
mod kv;
#[cfg(feature = "cloud")]
pub use kv::KvMirror;
