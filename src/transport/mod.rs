//! # Transport Layer
//!
//! Hand-off point between the HTTP upgrade layer and the engine.
//!
//! Any `AsyncRead + AsyncWrite` stream works: TCP, TLS, Unix sockets or an
//! in-memory duplex in tests. The engine never performs the handshake itself.

pub mod upgrade;
