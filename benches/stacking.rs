use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sigmastack::{clipped_mean_u16, clipped_median_u16};

fn synthetic_stack(array_count: usize, bin_count: usize) -> Vec<Vec<u16>> {
    let mut state = 0x9E3779B9u32;
    (0..array_count)
        .map(|_| {
            (0..bin_count)
                .map(|_| {
                    state = state.wrapping_mul(48271).wrapping_add(13);
                    (state >> 17) as u16
                })
                .collect()
        })
        .collect()
}

fn bench_clipped_mean(c: &mut Criterion) {
    let arrays = synthetic_stack(16, 1 << 16);
    let slices: Vec<&[u16]> = arrays.iter().map(|a| a.as_slice()).collect();
    let mut out = vec![0u16; 1 << 16];

    c.bench_function("clipped_mean_u16 16x65536", |b| {
        b.iter(|| {
            clipped_mean_u16(black_box(&mut out), black_box(&slices), 3.0, 3.0, 5).unwrap();
        })
    });
}

fn bench_clipped_median(c: &mut Criterion) {
    let arrays = synthetic_stack(16, 1 << 14);
    let slices: Vec<&[u16]> = arrays.iter().map(|a| a.as_slice()).collect();
    let mut out = vec![0u16; 1 << 14];

    c.bench_function("clipped_median_u16 16x16384", |b| {
        b.iter(|| {
            clipped_median_u16(black_box(&mut out), black_box(&slices), 3.0, 3.0, 5).unwrap();
        })
    });
}

criterion_group!(benches, bench_clipped_mean, bench_clipped_median);
criterion_main!(benches);
