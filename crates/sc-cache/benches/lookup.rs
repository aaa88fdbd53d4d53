//! Lookup-path throughput on a warm cache.

use criterion::{Criterion, criterion_group, criterion_main};
use sc_cache::{CacheConfig, CacheIoContext, CacheTransport, CachedIo, PageRef};
use sc_io::{DispatchMode, MemTransport};
use std::hint::black_box;
use std::sync::Arc;

const PAGES: u64 = 512;

fn warm_cache() -> Arc<CachedIo> {
    let config = CacheConfig {
        init_size: 1024 * 4096,
        max_size: 1024 * 4096,
        expandable: false,
        ..CacheConfig::default()
    };
    let transport = Arc::new(MemTransport::<PageRef, CacheIoContext>::new(
        8 << 20,
        DispatchMode::Inline,
    ));
    let io = CachedIo::new(config, transport as Arc<CacheTransport>).unwrap();
    for i in 0..PAGES {
        io.write(i * 4096, vec![0xAB; 4096]).unwrap();
    }
    io
}

fn bench_lookup(c: &mut Criterion) {
    let io = warm_cache();

    c.bench_function("cached_read_hit", |b| {
        let mut i = 0_u64;
        b.iter(|| {
            let offset = (i % PAGES) * 4096;
            i += 1;
            black_box(io.read(offset, 4096).unwrap());
        });
    });

    c.bench_function("directory_lookup", |b| {
        let mut i = 0_u64;
        b.iter(|| {
            let offset = (i % PAGES) * 4096;
            i += 1;
            black_box(io.cache().lookup(offset).page.offset());
        });
    });
}

criterion_group!(benches, bench_lookup);
criterion_main!(benches);
