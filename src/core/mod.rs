//! # Core Protocol Components
//!
//! Wire-level frame handling: header parsing, masking, fragmentation and the
//! tokio codec used to frame an upgraded byte stream.
//!
//! ## Components
//! - **Frame**: stateless encode/decode of single frames, control-frame
//!   builders, message chunking
//! - **Close**: status codes and close-frame payloads
//! - **Assembler**: incremental parser and fragment reassembly
//! - **Codec**: `tokio_util` Encoder/Decoder over the assembler
//!
//! ## Wire Format
//! ```text
//! [FIN|RSV(3)|OPCODE(4)] [MASK|LEN7] [LEN16 | LEN64]? [MASK KEY(4)]? [PAYLOAD]
//! ```
//!
//! ## Limits
//! - Control frames: at most 125 bytes, never fragmented
//! - Messages: bounded by the configured maximum before any payload is buffered

pub mod assembler;
pub mod close;
pub mod codec;
pub mod frame;
