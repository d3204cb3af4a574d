//! Shared library for cross-cutting concerns in auth-platform Rust services.
//!
//! This crate provides centralized implementations for:
//! - Error types with retryability classification
//! - Tracing subscriber initialization
//! - An injectable clock for deterministic time handling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod error;
pub mod tracing_config;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::PlatformError;
pub use tracing_config::{TracingConfig, init_tracing};
