#![no_main]

use libfuzzer_sys::fuzz_target;
use websocket_channels::core::close::parse_close_payload;
use websocket_channels::Frame;

fuzz_target!(|data: &[u8]| {
    // Fuzz single-frame and close-payload decoding - test for panics and bad lengths
    if let Ok(Some((frame, used))) = Frame::parse(data) {
        assert!(used <= data.len());
        let _ = parse_close_payload(&frame.payload);
    }
});
