//! HTTP adapter for the CRM API.

mod client;
pub mod retry;

pub use client::{HttpUpstream, UpstreamConfig};
pub use retry::{AttemptError, RetryPolicy};
