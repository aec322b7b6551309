#![no_main]

use libfuzzer_sys::fuzz_target;

use ledgernet_protocol::{FrameDecoder, MAX_MESSAGE_SIZE};

// Feed arbitrary bytes to the stream decoder in chunks whose sizes come
// from the input itself. The decoder must never panic and must stop at
// the first malformed frame.
fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(split).max(1);
    let mut decoder = FrameDecoder::new(MAX_MESSAGE_SIZE);
    for piece in rest.chunks(chunk) {
        decoder.extend(piece);
        loop {
            match decoder.next_message() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
