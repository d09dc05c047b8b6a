//! Directory-backed unit resolver.
//!
//! A unit named `a/b` is the directory `<root>/a/b`. Roots are searched in
//! order, the standard root first. Imports come from an optional `unit.toml`
//! manifest in the unit directory.

use ignore::WalkBuilder;
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::ResolveError;
use crate::unit::{BuildParams, ResolvedUnit, UnitId, UnitResolver};

/// Manifest declaring a unit's imports
pub const MANIFEST_FILE: &str = "unit.toml";

/// Fixture directory shipped with a unit as opaque bytes
pub const FIXTURE_DIR: &str = "testdata";

const TEST_SUFFIX: &str = "_test";

const KNOWN_OS: &[&str] = &[
    "linux", "macos", "windows", "freebsd", "netbsd", "openbsd", "android", "ios",
];

const KNOWN_ARCH: &[&str] = &[
    "x86", "x86_64", "arm", "aarch64", "riscv64", "powerpc64", "wasm32",
];

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Manifest {
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    test_imports: Vec<String>,
}

impl Manifest {
    /// Imports of the unit, with test imports when tests are included.
    pub(crate) fn imports_for(self, include_tests: bool) -> Vec<String> {
        let mut imports = self.imports;
        if include_tests {
            imports.extend(self.test_imports);
        }
        imports
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryResolver {
    roots: Vec<PathBuf>,
    std_root: Option<PathBuf>,
}

impl DirectoryResolver {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            std_root: None,
        }
    }

    /// Units under `root` are treated as standard library and never shipped.
    pub fn with_std_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.std_root = Some(root.into());
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn std_root(&self) -> Option<&Path> {
        self.std_root.as_deref()
    }

    fn search_roots(&self) -> impl Iterator<Item = (&Path, bool)> {
        self.std_root
            .iter()
            .map(|r| (r.as_path(), true))
            .chain(self.roots.iter().map(|r| (r.as_path(), false)))
    }

    fn locate(&self, name: &str) -> Option<(PathBuf, bool)> {
        self.search_roots().find_map(|(root, is_std)| {
            let dir = root.join(name);
            if dir.is_dir() && has_regular_file(&dir) {
                Some((dir, is_std))
            } else {
                None
            }
        })
    }
}

impl UnitResolver for DirectoryResolver {
    fn resolve(&self, id: &UnitId, params: &BuildParams) -> Result<ResolvedUnit, ResolveError> {
        validate_name(&id.name)?;

        let (dir, is_std) = self
            .locate(&id.name)
            .ok_or_else(|| ResolveError::NotFound {
                name: id.name.clone(),
            })?;

        let io_err = |source| ResolveError::Io {
            path: dir.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let Ok(name) = entry.file_name().into_string() else {
                tracing::warn!("Skipping non UTF-8 file name in {}", dir.display());
                continue;
            };
            if is_ignored_name(&name) || !entry.path().is_file() {
                continue;
            }
            if is_test_file(&name) && !id.include_tests {
                continue;
            }
            if !matches_platform(&name, params) {
                continue;
            }
            files.push(name);
        }
        files.sort();

        let imports = read_manifest(&dir)?.imports_for(id.include_tests);

        Ok(ResolvedUnit {
            name: id.name.clone(),
            dir,
            files,
            imports,
            is_standard_library: is_std,
        })
    }

    fn list_units(&self) -> Result<Vec<String>, ResolveError> {
        let mut units = Vec::new();

        for (root, _) in self.search_roots() {
            if !root.is_dir() {
                continue;
            }

            let walker = WalkBuilder::new(root)
                .standard_filters(false)
                .filter_entry(|entry| {
                    let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                    entry.depth() == 0 || !is_dir || !skip_dir(&entry.file_name().to_string_lossy())
                })
                .build();

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::debug!("Skipping unreadable entry under {}: {}", root.display(), e);
                        continue;
                    }
                };
                if entry.depth() == 0 || !entry.file_type().is_some_and(|t| t.is_dir()) {
                    continue;
                }
                if !has_regular_file(entry.path()) {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(root) {
                    units.push(to_slash(rel));
                }
            }
        }

        units.sort();
        units.dedup();
        Ok(units)
    }
}

fn read_manifest(dir: &Path) -> Result<Manifest, ResolveError> {
    let path = dir.join(MANIFEST_FILE);
    if !path.is_file() {
        return Ok(Manifest::default());
    }
    let text = fs::read_to_string(&path).map_err(|source| ResolveError::Io {
        path: path.clone(),
        source,
    })?;
    parse_manifest(&text, path)
}

pub(crate) fn parse_manifest(text: &str, path: PathBuf) -> Result<Manifest, ResolveError> {
    toml::from_str(text).map_err(|source| ResolveError::Manifest { path, source })
}

pub(crate) fn validate_name(name: &str) -> Result<(), ResolveError> {
    let invalid = || ResolveError::InvalidName {
        name: name.to_string(),
    };

    if name.is_empty() || name.contains('\\') {
        return Err(invalid());
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(invalid());
    }
    for component in path.components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(invalid());
        }
    }
    Ok(())
}

fn has_regular_file(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                let name = e.file_name();
                !is_ignored_name(&name.to_string_lossy()) && e.path().is_file()
            })
        })
        .unwrap_or(false)
}

pub(crate) fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

pub(crate) fn skip_dir(name: &str) -> bool {
    is_ignored_name(name) || name == FIXTURE_DIR || name == "node_modules"
}

fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}

pub(crate) fn is_test_file(name: &str) -> bool {
    file_stem(name).ends_with(TEST_SUFFIX)
}

/// `foo_linux.x` only builds for linux, `foo_aarch64.x` only for aarch64.
pub(crate) fn matches_platform(name: &str, params: &BuildParams) -> bool {
    let stem = file_stem(name);
    let stem = stem.strip_suffix(TEST_SUFFIX).unwrap_or(stem);
    let Some((_, suffix)) = stem.rsplit_once('_') else {
        return true;
    };

    if KNOWN_OS.contains(&suffix) {
        return params.target_os.is_empty() || params.target_os == suffix;
    }
    if KNOWN_ARCH.contains(&suffix) {
        return params.target_arch.is_empty() || params.target_arch == suffix;
    }
    true
}

/// Slash-separated form of a relative path.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
