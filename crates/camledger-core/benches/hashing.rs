use camledger_core::{Block, HashingService, MerkleTree, Transaction, TransactionType};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};

const NOW: u64 = 1_700_000_000;

fn bench_hash(c: &mut Criterion) {
    let hasher = HashingService::new();
    let mut rng = StdRng::seed_from_u64(42);
    let frame: Vec<u8> = (0..64 * 1024).map(|_| rng.gen()).collect();

    c.bench_function("sha256_64k_frame", |b| {
        b.iter(|| hasher.hash(&frame));
    });
}

fn bench_merkle(c: &mut Criterion) {
    let hasher = HashingService::new();
    let mut rng = StdRng::seed_from_u64(42);
    let mut group = c.benchmark_group("merkle_build");
    for leaves in [1usize, 10, 50, 100] {
        let hashes: Vec<_> = (0..leaves)
            .map(|_| hasher.hash(&rng.gen::<[u8; 32]>()))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(leaves), &hashes, |b, hashes| {
            b.iter(|| MerkleTree::build(hashes, &hasher).unwrap());
        });
    }
    group.finish();
}

fn bench_finalize(c: &mut Criterion) {
    let hasher = HashingService::new();
    let txs: Vec<Transaction> = (0..50u64)
        .map(|i| {
            Transaction::new(
                TransactionType::ImageCapture,
                hasher.hash(format!("frame-{i}").as_bytes()),
                format!(r#"{{"camera":"north","seq":{i}}}"#),
                NOW + i,
                48_000 + i,
            )
        })
        .collect();

    c.bench_function("finalize_block_50_txs", |b| {
        b.iter(|| {
            let mut block = Block::new(1, None, "cam-01", NOW);
            for tx in &txs {
                block.add_transaction(tx.clone()).unwrap();
            }
            block.finalize(&hasher).unwrap()
        });
    });
}

criterion_group!(benches, bench_hash, bench_merkle, bench_finalize);
criterion_main!(benches);
