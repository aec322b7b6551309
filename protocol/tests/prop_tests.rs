use proptest::prelude::*;

use ledgernet_messages::{
    GoAwayMessage, GoAwayReason, IdListMode, NetMessage, NoticeMessage, PackedTransaction,
    SelectIds, SyncRequestMessage,
};
use ledgernet_protocol::{decode, encode, FrameDecoder, ProtocolError};
use ledgernet_types::{Digest, Timestamp, TxId};

fn arb_message() -> impl Strategy<Value = NetMessage> {
    prop_oneof![
        (any::<u32>(), any::<u32>()).prop_map(|(start_block, end_block)| {
            SyncRequestMessage {
                start_block,
                end_block,
            }
            .into()
        }),
        (0u8..13, prop::array::uniform32(any::<u8>())).prop_map(|(r, id)| {
            let reason = match r {
                0 => GoAwayReason::None,
                1 => GoAwayReason::SelfConnect,
                2 => GoAwayReason::Duplicate,
                3 => GoAwayReason::WrongChain,
                4 => GoAwayReason::WrongVersion,
                5 => GoAwayReason::Forked,
                6 => GoAwayReason::Unlinkable,
                7 => GoAwayReason::BadTransaction,
                8 => GoAwayReason::Validation,
                9 => GoAwayReason::BenignOther,
                10 => GoAwayReason::FatalOther,
                11 => GoAwayReason::Authentication,
                _ => GoAwayReason::Crazy,
            };
            GoAwayMessage {
                reason,
                node_id: Digest::new(id),
            }
            .into()
        }),
        (prop::collection::vec(any::<u8>(), 0..512), any::<u64>()).prop_map(|(body, exp)| {
            PackedTransaction::new(body, Timestamp::from_nanos(exp)).into()
        }),
        (any::<u32>(), prop::collection::vec(prop::array::uniform32(any::<u8>()), 0..8))
            .prop_map(|(pending, ids)| {
                NoticeMessage {
                    known_trx: SelectIds::new(
                        IdListMode::Normal,
                        pending,
                        ids.into_iter().map(TxId::new).collect(),
                    ),
                    ..Default::default()
                }
                .into()
            }),
    ]
}

proptest! {
    /// A stream of frames split at arbitrary points decodes to the same
    /// messages in the same order.
    #[test]
    fn decoder_preserves_order_across_splits(
        msgs in prop::collection::vec(arb_message(), 1..12),
        chunk in 1usize..64,
    ) {
        let stream: Vec<u8> = msgs.iter().flat_map(|m| encode(m).unwrap()).collect();
        let mut decoder = FrameDecoder::default();
        let mut out = Vec::new();
        for piece in stream.chunks(chunk) {
            decoder.extend(piece);
            while let Some(msg) = decoder.next_message().unwrap() {
                out.push(msg);
            }
        }
        prop_assert_eq!(out, msgs);
        prop_assert_eq!(decoder.buffered(), 0);
    }

    /// Decoding arbitrary bytes never panics.
    #[test]
    fn decode_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode(&data);
    }

    /// Any tag past the last message kind is rejected as unknown.
    #[test]
    fn unknown_tags_rejected(tag in NetMessage::COUNT..=u8::MAX) {
        let frame = [1, 0, 0, 0, tag];
        prop_assert_eq!(decode(&frame), Err(ProtocolError::UnknownTag(tag)));
    }
}
