//! # Protocol Layer
//!
//! Connections, messages and the group abstractions built on them.
//!
//! ## Components
//! - **Message**: simple and advanced (event envelope) formatting
//! - **Connection**: per-socket driver task, handle and notifications
//! - **Broadcast**: format-once fan-out shared by channels and the host
//! - **Channel**: named group with a two-sided membership edge
//! - **Host**: connection and channel registries

pub mod broadcast;
pub mod channel;
pub mod connection;
pub mod host;
pub mod message;
