//! Storage backend abstraction.
//!
//! Every store implements [`StorageBackend`]: open, create, delete and walk
//! over slash-separated paths. Available backends:
//! - Local filesystem
//! - In-memory map
//! - S3-compatible object storage (AWS S3, MinIO, R2, etc.)
//! - Google Cloud Storage
//!
//! Backends compose: [`PrefixedStorage`] confines a store to a sub-tree and
//! [`CachedStorage`] chains stores into a read-through cache.

mod backend;
mod cache;
mod config;
mod error;
mod gcs;
mod local;
mod memory;
mod pipe;
mod prefix;
mod s3;
mod tee;
#[cfg(test)]
mod testing;

pub use backend::{
    write_all, BoxWriter, ByteReader, FileWriter, StorageBackend, StorageFile, WalkFn,
};
pub use cache::{BackfillError, BackfillHook, CachedStorage};
pub use config::{CacheConfig, StorageConfig, StorageType};
pub use error::{StorageError, StorageResult};
pub use gcs::{GcsConfig, GcsStorage};
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use pipe::{CancellableReader, PipeReader, StreamingWriter};
pub use prefix::PrefixedStorage;
pub use s3::{S3Config, S3Credentials, S3Storage};
pub use tee::TeeOptions;
