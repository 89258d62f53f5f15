//! Strata Platform - the microservices platform on a managed cluster
//!
//! Turns a [`PlatformConfig`] into the descriptor set converged by
//! `strata-core`, and reads the stack exports back from committed state.

#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod exports;
pub mod topology;

pub use config::{PlatformConfig, ReadinessConfig};
pub use error::PlatformError;
pub use exports::StackExports;
