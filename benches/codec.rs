//! Benchmarks for block codecs and TAS writes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use sums::codec::{adler32, rice};
use sums::tas::{self, Array, Compression, ElementType, Scaling};
use tempfile::TempDir;

/// Slowly varying image data with a little noise, like a detector frame
fn frame(n: usize) -> Vec<i16> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    (0..n)
        .map(|i| {
            let base = ((i % 1024) as f64 / 40.0).sin() * 800.0;
            base as i16 + rng.gen_range(-12..=12)
        })
        .collect()
}

fn benchmark_adler32(c: &mut Criterion) {
    let mut group = c.benchmark_group("adler32");

    for size in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        let data = vec![0xA5u8; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| adler32(1, black_box(data)));
        });
    }

    group.finish();
}

fn benchmark_rice(c: &mut Criterion) {
    let mut group = c.benchmark_group("rice_i16");

    for count in [1024, 65536, 262144].iter() {
        let samples = frame(*count);
        let max_out = count * 4 + 64;
        let encoded = rice::encode(&samples, 32, max_out).unwrap();
        group.throughput(Throughput::Bytes((count * 2) as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &samples, |b, samples| {
            b.iter(|| rice::encode(black_box(samples), 32, max_out).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &encoded, |b, encoded| {
            b.iter(|| rice::decode::<i16>(black_box(encoded), *count, 32).unwrap());
        });
    }

    group.finish();
}

fn benchmark_tas_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("tas_write");
    group.sample_size(20);

    let dir = TempDir::new().unwrap();
    let array = Array::from_values(vec![512, 512], &frame(512 * 512)).unwrap();

    for method in [Compression::None, Compression::Rice, Compression::Gzip, Compression::Zstd] {
        let path = dir.path().join(format!("bench-{}.tas", method));
        group.bench_function(BenchmarkId::from_parameter(method), |b| {
            b.iter(|| {
                tas::write(
                    &path,
                    ElementType::Raw,
                    Scaling::identity(),
                    method,
                    None,
                    black_box(&array),
                )
                .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_adler32, benchmark_rice, benchmark_tas_write);
criterion_main!(benches);
