use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pfa::archive::ArchiveWriter;
use pfa::common::DirEntry;
use pfa::compress::Codec;
use pfa::config::{ArchiveConfig, ReaderOptions};
use pfa::extract::read_stream;
use rand::{thread_rng, Rng};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tempfile::tempdir;

const FILES: usize = 32;
const FILE_SIZE: usize = 256 * 1024;

fn make_dataset(dir: &Path) -> Vec<DirEntry> {
    let mut rng = thread_rng();
    (0..FILES)
        .map(|i| {
            let path = dir.join(format!("blob_{i}.bin"));
            let mut data = vec![0u8; FILE_SIZE];
            // a quarter random, the rest compressible
            rng.fill(&mut data[..FILE_SIZE / 4]);
            fs::write(&path, &data).unwrap();
            DirEntry::from_path(&path).unwrap()
        })
        .collect()
}

fn codecs() -> [Codec; 3] {
    [Codec::None, Codec::Lz4, Codec::Zstd { level: 3 }]
}

fn archive(entries: &[DirEntry], codec: Codec, workers: usize) -> Vec<u8> {
    let config = ArchiveConfig::default().with_workers(workers).with_chunk_size(64 * 1024).with_codec(codec);
    let writer = ArchiveWriter::new(Vec::with_capacity(FILES * FILE_SIZE), &config).unwrap();
    for entry in entries {
        writer.append_file(entry.clone()).unwrap();
    }
    writer.finish().unwrap().0
}

fn benchmark_write_throughput(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let entries = make_dataset(dir.path());
    let mut group = c.benchmark_group("write_throughput");
    group.throughput(Throughput::Bytes((FILES * FILE_SIZE) as u64));
    group.sample_size(10);

    for codec in codecs() {
        for workers in [1, 4, 8] {
            group.bench_with_input(BenchmarkId::new(codec.name(), workers), &workers, |b, &workers| {
                b.iter(|| black_box(archive(&entries, codec, workers)));
            });
        }
    }
    group.finish();
}

fn benchmark_verify_throughput(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let entries = make_dataset(dir.path());
    let mut group = c.benchmark_group("verify_throughput");
    group.throughput(Throughput::Bytes((FILES * FILE_SIZE) as u64));
    group.sample_size(10);

    for codec in codecs() {
        let bytes = archive(&entries, codec, 8);
        group.bench_function(codec.name(), |b| {
            b.iter(|| {
                let outcome = read_stream(Cursor::new(&bytes), "bench", &ReaderOptions::verify_only()).unwrap();
                black_box(outcome.files)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_write_throughput, benchmark_verify_throughput);
criterion_main!(benches);
