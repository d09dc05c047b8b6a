//! Source side: building a fetch response from disk.

use bytes::Bytes;
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use super::{FetchRequest, FetchResponse, MAX_INLINE_BYTES};
use crate::cache::ContentCache;
use crate::collector::DependencyCollector;
use crate::error::SyncError;
use crate::fingerprint::Fingerprint;
use crate::resolver::{to_slash, FIXTURE_DIR};
use crate::unit::{ResolvedUnit, UnitResolver};

/// Summary of one served fetch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub units: usize,
    pub files: usize,
    /// Distinct contents shipped inline
    pub sent: usize,
    pub sent_bytes: u64,
    /// Unknown contents held back for a later round
    pub deferred: usize,
}

/// Build the response to `request` with the default inline limit.
pub fn build_response<R: UnitResolver + ?Sized>(
    resolver: &R,
    cache: &mut ContentCache,
    request: &FetchRequest,
) -> FetchResponse {
    build_response_with_limit(resolver, cache, request, MAX_INLINE_BYTES)
}

/// Build the response to `request`, carrying at most `inline_limit` bytes of
/// contents. The path map is always complete; contents that do not fit are
/// left out and the response is marked partial. Any failure, including a
/// single file over the limit, yields a response carrying only `error`.
pub fn build_response_with_limit<R: UnitResolver + ?Sized>(
    resolver: &R,
    cache: &mut ContentCache,
    request: &FetchRequest,
    inline_limit: u64,
) -> FetchResponse {
    match try_build(resolver, cache, request, inline_limit) {
        Ok((response, stats)) => {
            tracing::info!(
                unit = %request.unit,
                units = stats.units,
                files = stats.files,
                sent = stats.sent,
                sent_bytes = stats.sent_bytes,
                deferred = stats.deferred,
                "Uploading closure"
            );
            response
        }
        Err(e) => {
            tracing::warn!("Fetch of {} failed: {}", request.unit, e);
            FetchResponse::failed(e.to_string())
        }
    }
}

fn try_build<R: UnitResolver + ?Sized>(
    resolver: &R,
    cache: &mut ContentCache,
    request: &FetchRequest,
    inline_limit: u64,
) -> Result<(FetchResponse, FetchStats), SyncError> {
    let closure = DependencyCollector::new(resolver, &request.params).collect(&request.unit)?;

    // First writer wins on duplicate paths.
    let mut seen = HashSet::new();
    let mut planned: Vec<(String, PathBuf)> = Vec::new();
    for member in &closure {
        for (rel, path) in unit_files(&member.unit)? {
            let key = format!("{}/{}", member.unit.name, rel);
            if seen.insert(key.clone()) {
                planned.push((key, path));
            }
        }
    }

    let read: Vec<(String, Fingerprint, Bytes)> = planned
        .into_par_iter()
        .map(|(key, path)| {
            let data = fs::read(&path).map_err(|source| SyncError::Read { path, source })?;
            let fp = Fingerprint::of(&data);
            Ok((key, fp, Bytes::from(data)))
        })
        .collect::<Result<_, SyncError>>()?;

    let mut response = FetchResponse::default();
    for (key, fp, data) in read {
        cache.put(fp, data);
        response.files.insert(key, fp);
    }

    // Greedy fill in path order; whatever does not fit waits for the next round.
    let mut budget = inline_limit;
    let mut deferred = HashSet::new();
    for (path, fp) in &response.files {
        if request.known.contains(fp) || response.contents.contains_key(fp) {
            continue;
        }
        let Some(data) = cache.get(fp) else {
            continue;
        };
        let size = data.len() as u64;
        if size > inline_limit {
            return Err(SyncError::TooLarge {
                path: path.clone(),
                size,
                limit: inline_limit,
            });
        }
        if size > budget {
            deferred.insert(*fp);
            continue;
        }
        budget -= size;
        response.contents.insert(*fp, data.clone());
    }
    response.partial = !deferred.is_empty();

    let stats = FetchStats {
        units: closure.len(),
        files: response.files.len(),
        sent: response.contents.len(),
        sent_bytes: response.content_bytes(),
        deferred: deferred.len(),
    };
    Ok((response, stats))
}

/// Files of a unit as (relative path, absolute path), including its fixture tree.
fn unit_files(unit: &ResolvedUnit) -> Result<Vec<(String, PathBuf)>, SyncError> {
    let mut files: Vec<(String, PathBuf)> = unit
        .files
        .iter()
        .map(|name| (name.clone(), unit.dir.join(name)))
        .collect();

    let fixtures = unit.dir.join(FIXTURE_DIR);
    if fixtures.is_dir() {
        let mut extra = Vec::new();
        for entry in WalkBuilder::new(&fixtures).standard_filters(false).build() {
            let entry = entry.map_err(|e| SyncError::Read {
                path: fixtures.clone(),
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("fixture walk failed")),
            })?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&unit.dir) {
                extra.push((to_slash(rel), entry.path().to_path_buf()));
            }
        }
        extra.sort();
        files.extend(extra);
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::DirectoryResolver;
    use crate::unit::{BuildParams, UnitId};
    use std::collections::BTreeSet;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn workspace() -> TempDir {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "app/main.x", "import lib");
        write(tmp.path(), "app/unit.toml", "imports = [\"lib\"]");
        write(tmp.path(), "lib/util.x", "fn util");
        write(tmp.path(), "lib/copy.x", "import lib");
        write(tmp.path(), "lib/testdata/golden/out.txt", "golden");
        tmp
    }

    fn request(unit: UnitId, known: BTreeSet<Fingerprint>) -> FetchRequest {
        FetchRequest {
            unit,
            known,
            params: BuildParams::default(),
        }
    }

    #[test]
    fn test_build_full_response() {
        let tmp = workspace();
        let resolver = DirectoryResolver::new(vec![tmp.path().to_path_buf()]);
        let mut cache = ContentCache::new();

        let resp = build_response(
            &resolver,
            &mut cache,
            &request(UnitId::new("app"), BTreeSet::new()),
        );

        assert!(resp.error.is_none());
        let paths: Vec<_> = resp.files.keys().cloned().collect();
        assert_eq!(
            paths,
            vec![
                "app/main.x",
                "app/unit.toml",
                "lib/copy.x",
                "lib/testdata/golden/out.txt",
                "lib/util.x",
            ]
        );
        // app/main.x and lib/copy.x share content, so only four blobs travel.
        assert_eq!(resp.files["app/main.x"], resp.files["lib/copy.x"]);
        assert_eq!(resp.contents.len(), 4);
        for (fp, data) in &resp.contents {
            assert!(fp.verifies(data));
        }
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_known_fingerprints_are_omitted() {
        let tmp = workspace();
        let resolver = DirectoryResolver::new(vec![tmp.path().to_path_buf()]);
        let mut cache = ContentCache::new();

        let first = build_response(
            &resolver,
            &mut cache,
            &request(UnitId::new("app"), BTreeSet::new()),
        );
        let known: BTreeSet<_> = first.files.values().copied().collect();

        let second = build_response(&resolver, &mut cache, &request(UnitId::new("app"), known));
        assert!(second.contents.is_empty());
        assert_eq!(second.files, first.files);
    }

    #[test]
    fn test_resolution_failure_is_atomic() {
        let tmp = workspace();
        write(tmp.path(), "app/unit.toml", "imports = [\"lib\", \"missing\"]");
        let resolver = DirectoryResolver::new(vec![tmp.path().to_path_buf()]);
        let mut cache = ContentCache::new();

        let resp = build_response(
            &resolver,
            &mut cache,
            &request(UnitId::new("app"), BTreeSet::new()),
        );
        assert!(resp.error.unwrap().contains("missing"));
        assert!(resp.files.is_empty());
        assert!(resp.contents.is_empty());
    }

    #[test]
    fn test_inline_limit_splits_into_rounds() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "big/a.x", &"a".repeat(60));
        write(tmp.path(), "big/b.x", &"b".repeat(60));
        write(tmp.path(), "big/c.x", &"c".repeat(60));
        let resolver = DirectoryResolver::new(vec![tmp.path().to_path_buf()]);
        let mut cache = ContentCache::new();

        let mut known = BTreeSet::new();
        let mut rounds = 0;
        loop {
            let resp = build_response_with_limit(
                &resolver,
                &mut cache,
                &request(UnitId::new("big"), known.clone()),
                130,
            );
            assert!(resp.error.is_none());
            assert_eq!(resp.files.len(), 3);
            assert!(resp.content_bytes() <= 130);
            assert!(!resp.contents.is_empty());
            known.extend(resp.contents.keys().copied());
            rounds += 1;
            if !resp.partial {
                break;
            }
        }
        assert_eq!(rounds, 2);
        assert_eq!(known.len(), 3);
    }

    #[test]
    fn test_file_over_inline_limit_fails_fetch() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "big/huge.x", &"h".repeat(200));
        write(tmp.path(), "big/small.x", "s");
        let resolver = DirectoryResolver::new(vec![tmp.path().to_path_buf()]);
        let mut cache = ContentCache::new();

        let resp = build_response_with_limit(
            &resolver,
            &mut cache,
            &request(UnitId::new("big"), BTreeSet::new()),
            100,
        );
        let message = resp.error.unwrap();
        assert!(message.contains("big/huge.x"), "{}", message);
        assert!(message.contains("100-byte inline limit"), "{}", message);
        assert!(resp.files.is_empty());
        assert!(!resp.partial);
    }

    #[test]
    fn test_tests_included_for_root() {
        let tmp = workspace();
        write(tmp.path(), "app/main_test.x", "test main");
        write(tmp.path(), "lib/util_test.x", "test util");
        let resolver = DirectoryResolver::new(vec![tmp.path().to_path_buf()]);
        let mut cache = ContentCache::new();

        let resp = build_response(
            &resolver,
            &mut cache,
            &request(UnitId::with_tests("app"), BTreeSet::new()),
        );
        assert!(resp.files.contains_key("app/main_test.x"));
        assert!(!resp.files.contains_key("lib/util_test.x"));
    }
}
