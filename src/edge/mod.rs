//! Edge cache proxy.
//!
//! Sits between the application and the network, keeps three versioned
//! buckets (static assets, pages, API responses) and answers from them
//! when the network is gone.

mod background;
mod buckets;
mod config;
mod message;
mod proxy;

pub use buckets::{BucketStore, MemoryBuckets, SqliteBuckets};
pub use config::{BucketNames, EdgeConfig, Route};
pub use message::EdgeMessage;
pub use proxy::{EdgeProxy, WorkerState};

pub use crate::client::net::{CACHED_AT_HEADER, OFFLINE_HEADER, SERVED_FROM_HEADER};
