//! Wire-level frame encoding and decoding

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{Decoder, Encoder, Framed};
use websocket_channels::core::assembler::Incoming;
use websocket_channels::core::close::{build_close_payload, parse_close_payload, CloseCode};
use websocket_channels::core::frame::{
    apply_mask, build_header, chunk_and_wrap, decode_header, Frame, OpCode,
};
use websocket_channels::{ProtocolError, WebSocketCodec};

const MAX: usize = 16 * 1024 * 1024;

#[test]
fn test_unmasked_hello() {
    let mut wire = vec![0x81, 0x05];
    wire.extend_from_slice(b"Hello");

    let (frame, used) = Frame::parse(&wire).unwrap().unwrap();
    assert_eq!(used, 7);
    assert!(frame.fin);
    assert_eq!(frame.opcode, OpCode::Text);
    assert!(!frame.masked());
    assert_eq!(frame.len(), 5);
    assert_eq!(&frame.payload[..], b"Hello");
}

#[test]
fn test_masked_hello() {
    let key = [0x01, 0x02, 0x03, 0x04];
    let mut payload = b"Hello".to_vec();
    apply_mask(&mut payload, key, 0);

    let mut wire = vec![0x81, 0x85];
    wire.extend_from_slice(&key);
    wire.extend_from_slice(&payload);

    let (frame, _) = Frame::parse(&wire).unwrap().unwrap();
    assert_eq!(frame.mask, Some(key));
    assert_eq!(&frame.payload[..], b"Hello");
}

#[test]
fn test_close_normal_is_four_bytes() {
    let bytes = Frame::close(Some(CloseCode::NORMAL), "").to_bytes();
    assert_eq!(&bytes[..], &[0x88, 0x02, 0x03, 0xE8]);
}

#[test]
fn test_chunk_70000_into_two_frames() {
    let frames = chunk_and_wrap(OpCode::Binary, Bytes::from(vec![7u8; 70_000]), false, 65_535);
    assert_eq!(frames.len(), 2);

    assert!(!frames[0].fin);
    assert_eq!(frames[0].opcode, OpCode::Binary);
    assert_eq!(frames[0].len(), 65_535);

    assert!(frames[1].fin);
    assert_eq!(frames[1].opcode, OpCode::Continuation);
    assert_eq!(frames[1].len(), 4_465);
}

#[test]
fn test_header_bits() {
    let bits = decode_header(0x81 | 0x40, 0x80 | 126);
    assert!(bits.fin);
    assert!(bits.masked);
    assert!(bits.reserved);
    assert_eq!(bits.length_indicator, 126);
    assert_eq!(bits.extended_len_bytes(), 2);
    assert!(bits.validate().is_err());
}

#[test]
fn test_header_forms() {
    let (short, _) = build_header(true, OpCode::Binary, 125, false);
    let (medium, _) = build_header(true, OpCode::Binary, 126, false);
    let (long, key) = build_header(true, OpCode::Binary, 70_000, true);

    assert_eq!(short.len(), 2);
    assert_eq!(medium.len(), 4);
    assert_eq!(long.len(), 14);
    assert_eq!(long[1] & 0x7F, 127);
    assert_eq!(&long[10..14], &key.unwrap());
}

#[test]
fn test_close_payload_reason_and_app_code() {
    let payload = build_close_payload(Some(4001), "room full");
    let close = parse_close_payload(&payload).unwrap().unwrap();
    assert_eq!(close.code, 4001);
    assert_eq!(close.reason, "room full");

    assert!(parse_close_payload(&[]).unwrap().is_none());
    assert!(parse_close_payload(&[0x03]).is_err());
    assert!(parse_close_payload(&[0x03, 0xED]).is_err()); // 1005 is never sent
}

#[test]
fn test_encoder_masks_only_for_client() {
    let mut server = WebSocketCodec::server(MAX);
    let mut client = WebSocketCodec::client(MAX);

    let mut out = BytesMut::new();
    server.encode(Frame::text("hi"), &mut out).unwrap();
    assert_eq!(out[1] & 0x80, 0);

    out.clear();
    client.encode(Frame::text("hi"), &mut out).unwrap();
    assert_eq!(out[1] & 0x80, 0x80);

    // What the client wrote, the server reads back.
    let decoded = server.decode(&mut out).unwrap();
    assert_eq!(decoded, Some(Incoming::Text("hi".into())));
}

#[test]
fn test_server_rejects_unmasked_input() {
    let mut server = WebSocketCodec::server(MAX);
    let mut wire = BytesMut::from(&Frame::text("hi").to_bytes()[..]);

    let err = server.decode(&mut wire).unwrap_err();
    assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    assert_eq!(err.close_code(), Some(CloseCode::PROTOCOL_ERROR));
}

#[tokio::test]
async fn test_framed_over_duplex() {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let mut client = Framed::new(a, WebSocketCodec::client(MAX));
    let mut server = Framed::new(b, WebSocketCodec::server(MAX));

    let big = Bytes::from(vec![0x5Au8; 100_000]);
    for frame in chunk_and_wrap(OpCode::Binary, big.clone(), false, 65_535) {
        client.feed(frame).await.unwrap();
    }
    client.feed(Frame::ping(Bytes::from_static(b"p"))).await.unwrap();
    SinkExt::<Frame>::flush(&mut client).await.unwrap();

    match server.next().await.unwrap().unwrap() {
        Incoming::Binary(data) => assert_eq!(data, big),
        other => panic!("unexpected {:?}", other),
    }
    match server.next().await.unwrap().unwrap() {
        Incoming::Control(frame) => {
            assert_eq!(frame.opcode, OpCode::Ping);
            assert_eq!(&frame.payload[..], b"p");
        }
        other => panic!("unexpected {:?}", other),
    }
}
