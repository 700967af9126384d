//! Tokio codec pairing the [`FrameAssembler`] with a role-aware frame encoder.
//!
//! Wrap an upgraded transport in `Framed<T, WebSocketCodec>` to get a stream
//! of [`Incoming`] messages and a sink of [`Frame`]s.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::assembler::{FrameAssembler, Incoming};
use crate::core::frame::{generate_mask, Frame};
use crate::error::{ProtocolError, Result};

/// Which end of the connection this codec speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts masked frames, sends unmasked ones.
    #[default]
    Server,
    /// Accepts unmasked frames, masks everything it sends.
    Client,
}

impl Role {
    /// Whether frames sent in this role carry a mask key.
    #[inline]
    pub fn masks_outbound(self) -> bool {
        self == Role::Client
    }
}

#[derive(Debug)]
pub struct WebSocketCodec {
    assembler: FrameAssembler,
    role: Role,
}

impl WebSocketCodec {
    pub fn new(role: Role, max_message_size: usize) -> Self {
        Self {
            assembler: FrameAssembler::new(role, max_message_size),
            role,
        }
    }

    pub fn server(max_message_size: usize) -> Self {
        Self::new(Role::Server, max_message_size)
    }

    pub fn client(max_message_size: usize) -> Self {
        Self::new(Role::Client, max_message_size)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn assembler(&self) -> &FrameAssembler {
        &self.assembler
    }
}

impl Decoder for WebSocketCodec {
    type Item = Incoming;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>> {
        self.assembler.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>> {
        self.assembler.decode_eof(src)
    }
}

impl Encoder<Frame> for WebSocketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<()> {
        // The key on a shared frame is ignored; each write gets its own.
        frame.mask = self.role.masks_outbound().then(generate_mask);
        frame.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::OpCode;

    #[test]
    fn server_writes_unmasked() {
        let mut codec = WebSocketCodec::server(1024);
        let mut dst = BytesMut::new();
        codec
            .encode(Frame::text("Hello").with_mask([9, 9, 9, 9]), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn client_to_server_round_trip() {
        let mut client = WebSocketCodec::client(1024);
        let mut server = WebSocketCodec::server(1024);

        let mut wire = BytesMut::new();
        client.encode(Frame::binary(vec![1u8, 2, 3]), &mut wire).unwrap();
        assert_eq!(wire[1] & 0x80, 0x80, "client frames must be masked");

        assert_eq!(
            server.decode(&mut wire).unwrap(),
            Some(Incoming::Binary(vec![1u8, 2, 3].into()))
        );
    }

    #[test]
    fn server_to_client_round_trip() {
        let mut server = WebSocketCodec::server(1024);
        let mut client = WebSocketCodec::client(1024);

        let mut wire = BytesMut::new();
        server.encode(Frame::pong(&b"beat"[..]), &mut wire).unwrap();
        match client.decode(&mut wire).unwrap() {
            Some(Incoming::Control(frame)) => {
                assert_eq!(frame.opcode, OpCode::Pong);
                assert_eq!(&frame.payload[..], b"beat");
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }
}
