// SPDX-License-Identifier: Apache-2.0
//
// Criterion benchmarks for encrypted storage, key sanitization, and
// secure deletion in the cinder-secure crate.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::tempdir;

use cinder_secure::{sanitize_key, DestructionEngine, EncryptedTempStore};

/// Honor `RUST_LOG` so bench runs can be traced; repeat calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Benchmark a full store-then-retrieve round trip on a 10 KiB payload.
///
/// This exercises nonce generation, AES-256-GCM sealing, the atomic
/// write, and the corresponding read/authenticate/decrypt path.
fn bench_store_retrieve_roundtrip(c: &mut Criterion) {
    init_tracing();
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let dir = tempdir().expect("tempdir");

    let store = rt.block_on(async {
        let store = EncryptedTempStore::new(
            dir.path().join("bench-store"),
            "bench",
            DestructionEngine::new(2),
        )
        .expect("store");
        store.initialize().await.expect("initialize");
        store
    });

    let payload = vec![0x42u8; 10 * 1024]; // 10 KiB

    c.bench_function("store_retrieve_roundtrip (10 KiB)", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .store("bench-item", black_box(&payload))
                    .await
                    .expect("store");
                let back = store.retrieve("bench-item").await.expect("retrieve");
                assert_eq!(back.len(), payload.len());
                black_box(&back[0]);
            });
        });
    });
}

/// Benchmark key sanitization over representative key shapes.
fn bench_sanitize_key(c: &mut Criterion) {
    init_tracing();
    let keys: &[(&str, String)] = &[
        ("plain", "twitter-archive-2024".to_owned()),
        ("traversal", "../../etc/passwd".to_owned()),
        ("long (hashes)", "k".repeat(400)),
    ];

    let mut group = c.benchmark_group("sanitize_key");
    for (label, key) in keys {
        group.bench_function(*label, |b| {
            b.iter(|| {
                let name = sanitize_key(black_box(key));
                black_box(name);
            });
        });
    }
    group.finish();
}

/// Benchmark the manual three-pass overwrite-and-unlink sequence on a
/// 256 KiB file — the dominant cost of environment teardown.
fn bench_secure_delete(c: &mut Criterion) {
    init_tracing();
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let dir = tempdir().expect("tempdir");
    let engine = DestructionEngine::manual_only(3);
    let payload = vec![0xA5u8; 256 * 1024];

    c.bench_function("secure_delete_file (256 KiB, 3 passes)", |b| {
        b.iter(|| {
            rt.block_on(async {
                let path = dir.path().join("victim.bin");
                tokio::fs::write(&path, &payload).await.expect("write");
                engine.secure_delete_file(&path).await.expect("delete");
            });
        });
    });
}

criterion_group!(
    benches,
    bench_store_retrieve_roundtrip,
    bench_sanitize_key,
    bench_secure_delete
);
criterion_main!(benches);
