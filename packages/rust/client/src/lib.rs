//! HTTP client for the Mapper API.
//!
//! This crate provides:
//! - [`MapperClient`]: one JSON POST per input, with jittered retry on transient failures
//! - [`backoff`]: the delay schedule between attempts

pub mod backoff;
pub mod client;

pub use backoff::retry_delay;
pub use client::{MapperClient, endpoint_url};
