//! # websocket-channels
//!
//! A WebSocket framing engine with named channels and broadcast.
//!
//! The crate starts where the HTTP upgrade ends: it takes an already-upgraded
//! duplex stream, parses RFC 6455 frames incrementally, reassembles
//! fragmented messages, and drives each connection on its own task. On top of
//! that it groups connections into lazily-created named channels and fans
//! messages out to a whole group without one slow peer holding up the rest.
//!
//! ## Layers
//! - [`core`]: frames, masking, close payloads, the assembler and the codec
//! - [`protocol`]: messages, connections, channels, the host
//! - [`transport`]: the upgrade hand-off and the accept loop
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging and metrics
//!
//! ## Example
//! ```no_run
//! use websocket_channels::{Broadcaster, ConnectionEvent, Host, UpgradeRequest};
//!
//! # async fn run(stream: tokio::net::TcpStream) -> websocket_channels::Result<()> {
//! let host = Host::default();
//! let mut conn = host.accept(stream, UpgradeRequest::new("/chat"))?;
//! host.channel("lobby").bind(conn.handle());
//!
//! while let Some(event) = conn.recv().await {
//!     if let ConnectionEvent::Message(msg) = event {
//!         host.channel("lobby").broadcast_except(msg, conn.id())?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::config::EngineConfig;
pub use crate::core::close::{CloseCode, CloseFrame};
pub use crate::core::codec::{Role, WebSocketCodec};
pub use crate::core::frame::{Frame, OpCode};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::broadcast::{BroadcastReport, Broadcaster, PreparedMessage};
pub use crate::protocol::channel::{Channel, ChannelEvent};
pub use crate::protocol::connection::{Connection, ConnectionEvent, ConnectionHandle, ConnectionId};
pub use crate::protocol::host::{Host, HostEvent};
pub use crate::protocol::message::{Message, Mode};
pub use crate::transport::upgrade::{serve, UpgradeRequest, Upgraded};
