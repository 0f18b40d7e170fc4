//! Offline-aware data sync for Lifelines.
//!
//! Reads go through [`client::ResilientClient`], which serves cached data
//! when the network is down, and writes that cannot reach the server wait
//! in [`queue::MutationQueue`] until [`monitor::NetworkMonitor`] sees the
//! network return. [`edge::EdgeProxy`] adds a versioned response cache
//! below the client.

pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod edge;
pub mod logging;
pub mod monitor;
pub mod queue;
