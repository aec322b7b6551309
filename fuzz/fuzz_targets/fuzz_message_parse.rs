#![no_main]

use libfuzzer_sys::fuzz_target;

use ledgernet_messages::NetMessage;

// Decode arbitrary bytes as a frame body and as a whole frame. Anything
// that decodes must re-encode, and handshake validation must not panic.
fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = ledgernet_protocol::codec::decode_body(data) {
        if let NetMessage::Handshake(hs) = &msg {
            let _ = ledgernet_protocol::check_handshake(hs);
        }
        let _ = ledgernet_protocol::encode(&msg);
    }
    let _ = ledgernet_protocol::decode(data);
});
