//! Unit resolver over a fetched tree.
//!
//! Applies the same layout rules as the directory resolver, but every
//! directory listing and manifest read goes through a [`VirtualFileSystem`].
//! Closures computed here match the agent's, so consumer-side tools can work
//! from the synchronized sources without touching disk.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use super::{EntryKind, VirtualFileSystem};
use crate::error::{ResolveError, VfsError};
use crate::resolver::{
    is_ignored_name, is_test_file, matches_platform, parse_manifest, skip_dir, validate_name,
    Manifest, MANIFEST_FILE,
};
use crate::unit::{BuildParams, ResolvedUnit, UnitId, UnitResolver};

/// Resolves units from a [`VirtualFileSystem`] rooted at the unit names.
///
/// `ResolvedUnit::dir` is the unit's path inside the filesystem. Nothing is
/// treated as standard library: standard units never travel.
#[derive(Debug, Clone)]
pub struct VfsResolver {
    vfs: Arc<VirtualFileSystem>,
}

impl VfsResolver {
    pub fn new(vfs: impl Into<Arc<VirtualFileSystem>>) -> Self {
        Self { vfs: vfs.into() }
    }

    pub fn vfs(&self) -> &VirtualFileSystem {
        &self.vfs
    }

    fn read_manifest(&self, unit: &str) -> Result<Manifest, ResolveError> {
        let path = format!("{}/{}", unit, MANIFEST_FILE);
        let data = match self.vfs.read(&path) {
            Ok(data) => data,
            Err(VfsError::NotFound(_)) => return Ok(Manifest::default()),
            Err(e) => return Err(vfs_io(&path, e)),
        };
        let text = std::str::from_utf8(&data)
            .map_err(|e| vfs_io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
        parse_manifest(text, PathBuf::from(path))
    }

    fn has_regular_file(&self, dir: &str) -> bool {
        self.vfs.read_dir(dir).is_ok_and(|entries| {
            entries
                .iter()
                .any(|e| e.kind == EntryKind::File && !is_ignored_name(&e.name))
        })
    }
}

fn vfs_io(path: &str, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> ResolveError {
    ResolveError::Io {
        path: PathBuf::from(path),
        source: io::Error::other(source),
    }
}

impl UnitResolver for VfsResolver {
    fn resolve(&self, id: &UnitId, params: &BuildParams) -> Result<ResolvedUnit, ResolveError> {
        validate_name(&id.name)?;
        let not_found = || ResolveError::NotFound {
            name: id.name.clone(),
        };

        let entries = match self.vfs.read_dir(&id.name) {
            Ok(entries) => entries,
            Err(VfsError::NotFound(_) | VfsError::NotDirectory(_)) => return Err(not_found()),
            Err(e) => return Err(vfs_io(&id.name, e)),
        };
        if !self.has_regular_file(&id.name) {
            return Err(not_found());
        }

        // read_dir is already sorted by name.
        let files: Vec<String> = entries
            .into_iter()
            .filter(|e| e.kind == EntryKind::File && !is_ignored_name(&e.name))
            .filter(|e| id.include_tests || !is_test_file(&e.name))
            .filter(|e| matches_platform(&e.name, params))
            .map(|e| e.name)
            .collect();

        Ok(ResolvedUnit {
            name: id.name.clone(),
            dir: PathBuf::from(&id.name),
            files,
            imports: self.read_manifest(&id.name)?.imports_for(id.include_tests),
            is_standard_library: false,
        })
    }

    fn list_units(&self) -> Result<Vec<String>, ResolveError> {
        let mut units = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(dir) = pending.pop() {
            let entries = self.vfs.read_dir(&dir).map_err(|e| vfs_io(&dir, e))?;
            for entry in entries {
                if entry.kind != EntryKind::Dir || skip_dir(&entry.name) {
                    continue;
                }
                let path = if dir.is_empty() {
                    entry.name
                } else {
                    format!("{}/{}", dir, entry.name)
                };
                if self.has_regular_file(&path) {
                    units.push(path.clone());
                }
                pending.push(path);
            }
        }

        units.sort();
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn vfs(files: &[(&str, &str)]) -> VirtualFileSystem {
        VirtualFileSystem::from_tree(
            files
                .iter()
                .map(|(path, data)| (path.to_string(), Bytes::copy_from_slice(data.as_bytes()))),
        )
        .unwrap()
    }

    fn linux() -> BuildParams {
        BuildParams {
            target_os: "linux".to_string(),
            target_arch: "x86_64".to_string(),
            tags: vec![],
        }
    }

    #[test]
    fn test_resolve_applies_file_rules() {
        let resolver = VfsResolver::new(vfs(&[
            ("app/main.x", "main"),
            ("app/main_test.x", "test"),
            ("app/poll_linux.x", ""),
            ("app/poll_windows.x", ""),
            ("app/_scratch.x", ""),
            ("app/testdata/in.txt", ""),
            ("app/unit.toml", "imports = [\"lib\"]\ntest_imports = [\"assert\"]"),
        ]));

        let unit = resolver.resolve(&UnitId::new("app"), &linux()).unwrap();
        assert_eq!(unit.files, vec!["main.x", "poll_linux.x", "unit.toml"]);
        assert_eq!(unit.imports, vec!["lib"]);
        assert_eq!(unit.dir, PathBuf::from("app"));
        assert!(!unit.is_standard_library);

        let unit = resolver.resolve(&UnitId::with_tests("app"), &linux()).unwrap();
        assert!(unit.files.contains(&"main_test.x".to_string()));
        assert_eq!(unit.imports, vec!["lib", "assert"]);
    }

    #[test]
    fn test_resolve_missing_and_invalid() {
        let resolver = VfsResolver::new(vfs(&[("app/main.x", ""), ("only/sub/deep.x", "")]));

        for missing in ["nope", "only", "app/main.x"] {
            assert!(
                matches!(
                    resolver.resolve(&UnitId::new(missing), &linux()),
                    Err(ResolveError::NotFound { .. })
                ),
                "{missing:?} should not resolve"
            );
        }
        assert!(matches!(
            resolver.resolve(&UnitId::new("../app"), &linux()),
            Err(ResolveError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_bad_manifest() {
        let resolver = VfsResolver::new(vfs(&[("app/unit.toml", "imports = 3")]));
        assert!(matches!(
            resolver.resolve(&UnitId::new("app"), &linux()),
            Err(ResolveError::Manifest { .. })
        ));
    }

    #[test]
    fn test_list_units() {
        let resolver = VfsResolver::new(vfs(&[
            ("app/main.x", ""),
            ("lib/util.x", ""),
            ("lib/net/http.x", ""),
            ("lib/testdata/golden.txt", ""),
            (".cache/blob", ""),
            ("empty/sub/x.x", ""),
        ]));
        assert_eq!(
            resolver.list_units().unwrap(),
            vec!["app", "empty/sub", "lib", "lib/net"]
        );
    }
}
