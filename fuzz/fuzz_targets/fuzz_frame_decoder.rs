//! Fuzz target: `FrameDecoder::feed`
//!
//! Feeds arbitrary bytes into the streaming decoder, split at a
//! data-dependent point, and checks that every yielded frame re-encodes to
//! the bytes it was decoded from. A zero-length extended header comes back
//! as a plain header.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use aptlink::apt::codec::FrameDecoder;
use aptlink::apt::protocol::EXTENDED_FLAG;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let cut = data.first().map_or(0, |&b| usize::from(b)).min(data.len());
    let mut decoder = FrameDecoder::new();
    let mut frames = decoder.feed(&data[..cut]);
    frames.extend(decoder.feed(&data[cut..]));

    let mut consumed = 0;
    for frame in &frames {
        let bytes = frame.encode().expect("decoded payload fits the length field");
        let mut source = data[consumed..consumed + bytes.len()].to_vec();
        if frame.payload.is_empty() {
            source[4] &= !EXTENDED_FLAG;
        }
        assert_eq!(source, bytes);
        consumed += bytes.len();
    }

    // After a reset the decoder must accept bytes cleanly again.
    decoder.reset();
    assert!(decoder.is_idle());
    let _ = decoder.feed(data);
});
