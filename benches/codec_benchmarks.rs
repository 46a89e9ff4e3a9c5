// ABOUTME: Benchmark suite for codec hot paths: message encode, decode, and browse-response
// ABOUTME: compression, which is the one part of this crate doing real per-byte work

use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use slsk_peer::datatypes::{BrowseResponse, Directory, FileAttribute, FileEntry, PrivateMessage};

fn sample_private_message() -> PrivateMessage {
    PrivateMessage {
        id: 1,
        timestamp: 1_700_000_000,
        username: "nicotine_plus_plus".into(),
        message: "are you still sharing that album?".into(),
        is_admin: false,
    }
}

fn sample_browse_response(directories: usize, files_per_directory: usize) -> BrowseResponse {
    let mut dirs = Vec::with_capacity(directories);
    for d in 0..directories {
        let mut files = Vec::with_capacity(files_per_directory);
        for f in 0..files_per_directory {
            files.push(FileEntry {
                filename: format!("track_{f:03}.flac"),
                size: 42_000_000,
                extension: "flac".into(),
                attributes: vec![FileAttribute { kind: 1, value: 1411 }],
            });
        }
        dirs.push(Directory {
            name: format!("Artist\\Album {d}"),
            files,
            locked: false,
        });
    }
    BrowseResponse {
        directories: dirs,
        locked_directories: vec![],
    }
}

fn bench_private_message_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("private_message");
    group.measurement_time(Duration::from_secs(5));

    let msg = sample_private_message();
    group.bench_function("encode", |b| b.iter(|| black_box(&msg).encode()));

    let encoded = msg.encode();
    group.bench_function("decode", |b| {
        b.iter(|| PrivateMessage::decode(black_box(encoded.slice(4..))).unwrap())
    });

    group.finish();
}

fn bench_browse_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("browse_response");
    group.measurement_time(Duration::from_secs(5));

    for (directories, files) in [(10, 20), (100, 50)] {
        let response = sample_browse_response(directories, files);
        group.bench_function(format!("encode_{directories}x{files}"), |b| {
            b.iter(|| black_box(&response).encode())
        });

        let encoded = response.encode();
        group.bench_function(format!("decode_{directories}x{files}"), |b| {
            b.iter(|| BrowseResponse::decode(black_box(encoded.slice(4..))).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_private_message_round_trip, bench_browse_response);
criterion_main!(benches);
