#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;
use websocket_channels::core::assembler::FrameAssembler;
use websocket_channels::Role;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes in uneven pieces - test for panics and runaway buffering
    let mut assembler = FrameAssembler::new(Role::Server, 64 * 1024);
    let mut src = BytesMut::new();
    for piece in data.chunks(7) {
        src.extend_from_slice(piece);
        loop {
            match assembler.decode(&mut src) {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
