//! Local persistence for offline support.
//!
//! This module provides:
//! - A key-value backend interface with SQLite, in-memory and no-op implementations
//! - A timestamped cache whose freshness is chosen by the reader, not the writer
//! - Silent degradation to "nothing cached" whenever storage misbehaves

mod storage;
mod store;

pub use storage::{KvBackend, MemoryBackend, NoopBackend, SqliteBackend};
pub use store::{CacheEntry, CacheHit, LocalCache, CACHE_PREFIX};
