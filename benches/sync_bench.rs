use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use srctunnel::cache::ContentCache;
use srctunnel::resolver::DirectoryResolver;
use srctunnel::sync::{apply_response, build_response, FetchRequest};
use srctunnel::{BuildParams, UnitId};
use tempfile::TempDir;

/// A chain of `units` units, each importing the next, with `files` files apiece.
fn make_workspace(units: usize, files: usize) -> TempDir {
    let temp = TempDir::new().unwrap();
    for u in 0..units {
        let dir = temp.path().join(format!("unit{}", u));
        fs::create_dir_all(&dir).unwrap();
        if u + 1 < units {
            fs::write(
                dir.join("unit.toml"),
                format!("imports = [\"unit{}\"]", u + 1),
            )
            .unwrap();
        }
        for f in 0..files {
            let body = format!("// unit {} file {}\n{}", u, f, "x".repeat(2048));
            fs::write(dir.join(format!("file{}.x", f)), body).unwrap();
        }
    }
    temp
}

fn request(known: BTreeSet<srctunnel::Fingerprint>) -> FetchRequest {
    FetchRequest {
        unit: UnitId::new("unit0"),
        known,
        params: BuildParams::host(),
    }
}

fn resolver(root: &Path) -> DirectoryResolver {
    DirectoryResolver::new(vec![root.to_path_buf()])
}

fn bench_build_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_response");

    for units in [4, 16, 64].iter() {
        let temp = make_workspace(*units, 20);
        let resolver = resolver(temp.path());

        group.bench_with_input(BenchmarkId::new("cold", units), units, |b, _| {
            b.iter(|| {
                let mut cache = ContentCache::new();
                build_response(black_box(&resolver), &mut cache, &request(BTreeSet::new()))
            });
        });

        // Requester already holds everything: only the path map travels.
        let mut cache = ContentCache::new();
        let full = build_response(&resolver, &mut cache, &request(BTreeSet::new()));
        let known: BTreeSet<_> = full.contents.keys().copied().collect();
        group.bench_with_input(BenchmarkId::new("delta", units), units, |b, _| {
            b.iter(|| build_response(black_box(&resolver), &mut cache, &request(known.clone())));
        });
    }
    group.finish();
}

fn bench_apply_response(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_response");

    for units in [4, 16, 64].iter() {
        let temp = make_workspace(*units, 20);
        let resolver = resolver(temp.path());
        let mut source_cache = ContentCache::new();
        let response = build_response(&resolver, &mut source_cache, &request(BTreeSet::new()));

        group.bench_with_input(BenchmarkId::from_parameter(units), units, |b, _| {
            b.iter(|| {
                let mut cache = ContentCache::new();
                apply_response(&mut cache, black_box(response.clone())).unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build_response, bench_apply_response);
criterion_main!(benches);
