use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ledgernet_messages::{
    BlockHeader, NetMessage, PackedTransaction, ReceiptTrx, SignedBlock, TransactionReceipt,
    TransactionStatus,
};
use ledgernet_protocol::{decode, encode, FrameDecoder};
use ledgernet_types::{BlockId, Timestamp};

fn sample_block(txns: usize) -> NetMessage {
    let transactions = (0..txns)
        .map(|i| TransactionReceipt {
            status: TransactionStatus::Executed,
            cpu_usage_us: 100,
            net_usage_words: 16,
            trx: ReceiptTrx::Packed(PackedTransaction::new(
                vec![i as u8; 128],
                Timestamp::from_secs(60),
            )),
        })
        .collect();
    SignedBlock {
        header: BlockHeader {
            producer: "producer1".into(),
            previous: BlockId::from_digest(41, [7; 32]),
            ..Default::default()
        },
        transactions,
        ..Default::default()
    }
    .into()
}

fn encode_block_bench(c: &mut Criterion) {
    let msg = sample_block(100);
    c.bench_function("encode_block_100_trx", |b| {
        b.iter(|| encode(black_box(&msg)).unwrap())
    });
}

fn decode_block_bench(c: &mut Criterion) {
    let bytes = encode(&sample_block(100)).unwrap();
    c.bench_function("decode_block_100_trx", |b| {
        b.iter(|| decode(black_box(&bytes)).unwrap())
    });
}

fn frame_decoder_stream_bench(c: &mut Criterion) {
    let stream: Vec<u8> = (0..32)
        .flat_map(|_| encode(&sample_block(4)).unwrap())
        .collect();
    c.bench_function("frame_decoder_32_blocks_1k_reads", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::default();
            let mut n = 0;
            for piece in stream.chunks(1024) {
                decoder.extend(piece);
                while let Ok(Some(_)) = decoder.next_message() {
                    n += 1;
                }
            }
            black_box(n)
        })
    });
}

criterion_group!(
    benches,
    encode_block_bench,
    decode_block_bench,
    frame_decoder_stream_bench
);
criterion_main!(benches);
