//! Performance benchmarks for hot labflash paths
//!
//! Stream decoding runs once per byte chunk of every remote build log, and
//! artifact listing runs on every artifact request.

use criterion::{Criterion, criterion_group, criterion_main};
use labflash::models::{ArtifactKind, BuildResult, StreamRecord};
use labflash::services::{ArtifactStore, StreamDecoder};
use labflash::utils::esptool_utils::{clean_message, parse_chip};
use std::hint::black_box;
use tempfile::TempDir;

fn sample_stream(lines: usize) -> Vec<u8> {
    let mut out = String::new();
    for i in 0..lines {
        out.push_str(
            &StreamRecord::delta(format!("Compiling .pio/build/tbeam-1w/src/module_{}.cpp.o\n", i)).to_line(),
        );
    }
    out.push_str(&StreamRecord::done_with_result(BuildResult::failure("benchmark")).to_line());
    out.into_bytes()
}

/// Benchmark decoding a build log delivered in network-sized and tiny chunks
fn benchmark_stream_decoding(c: &mut Criterion) {
    let data = sample_stream(2_000);

    for (name, size) in [("stream_decode_4k_chunks", 4096), ("stream_decode_7b_chunks", 7)] {
        c.bench_function(name, |b| {
            b.iter(|| {
                let mut decoder = StreamDecoder::new();
                for chunk in data.chunks(size) {
                    black_box(decoder.push(black_box(chunk)));
                }
                black_box(decoder.finish());
            });
        });
    }
}

/// Benchmark esptool output parsing
fn benchmark_esptool_parsing(c: &mut Criterion) {
    let output = "esptool v5.0.2\nConnected to ESP32-S3 on /dev/ttyACM0:\nChip type:          ESP32-S3 (QFN56) (revision v0.2)\nFeatures:           Wi-Fi, BT 5 (LE), Dual Core + LP Core, 240MHz\nMAC:                24:58:7c:00:00:01\n";
    let noisy = format!("\x1b[31m{}\x1b[0m", "A fatal error occurred: ".repeat(200));

    c.bench_function("parse_chip", |b| {
        b.iter(|| black_box(parse_chip(black_box(output))));
    });
    c.bench_function("clean_message_long", |b| {
        b.iter(|| black_box(clean_message(black_box(&noisy))));
    });
}

/// Benchmark listing a store with a few hundred builds and backups
fn benchmark_artifact_listing(c: &mut Criterion) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let root = temp_dir.path();
    let artifacts = root.join("artifacts");
    for i in 0..200 {
        let firmware = if i % 2 == 0 { "meshtastic" } else { "meshcore" };
        let dir = artifacts.join(format!("t_beam_1w/{}/build_env_{:03}", firmware, i));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("firmware.bin"), [0xE9u8; 64]).unwrap();
    }
    std::fs::create_dir_all(artifacts.join("backups")).unwrap();
    for i in 0..50 {
        std::fs::write(artifacts.join(format!("backups/backup_{:03}.bin", i)), [0xFFu8; 64]).unwrap();
    }

    let store = ArtifactStore::open(
        root.to_path_buf(),
        artifacts.clone(),
        vec!["meshtastic".to_string(), "meshcore".to_string()],
    );
    let registered = artifacts.join("t_beam_1w/meshtastic/build_env_000/firmware.bin");
    store
        .register(&registered, "firmware.bin", ArtifactKind::Artifact)
        .expect("Failed to register artifact");

    c.bench_function("artifact_list_filtered", |b| {
        b.iter(|| black_box(store.list(black_box(Some("meshtastic")))));
    });
}

criterion_group!(
    benches,
    benchmark_stream_decoding,
    benchmark_esptool_parsing,
    benchmark_artifact_listing
);
criterion_main!(benches);
