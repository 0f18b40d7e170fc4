//! Application-side access to the API.
//!
//! [`ResilientClient`] wraps any [`Network`] (plain HTTP, or the edge proxy
//! layered over it) and turns network trouble into cached reads and queued
//! writes instead of errors.

pub mod net;
mod resilient;
mod result;

pub use net::{HttpNetwork, Method, Network, Request, Response};
pub use resilient::{RequestConfig, ResilientClient};
pub use result::{FetchResult, FetchSource};
