//! # Utility Modules
//!
//! Supporting utilities for logging, metrics and timing.
//!
//! ## Components
//! - **Logging**: structured logging configuration
//! - **Metrics**: thread-safe observability counters
//! - **Timeout**: timeout defaults and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub(crate) mod sync;
