//! Infrastructure layer modules
//!
//! Shared components used by every transport:
//! - `backoff`: Reconnect delay policy
//! - `config`: Application configuration and settings
//! - `error`: Unified error type
//! - `metrics`: Prometheus metrics helpers

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
