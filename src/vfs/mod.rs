//! Read-only in-memory filesystem over a synchronized closure.

pub mod materialize;
pub mod resolver;

use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::Cursor;

use crate::error::VfsError;

pub use materialize::{materialize, MaterializeStats};
pub use resolver::VfsResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub kind: EntryKind,
    /// Content length; zero for directories
    pub len: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Slash-separated, relative, no `.`/`..` segments. The root is `""`.
fn normalize(path: &str) -> Result<String, VfsError> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(VfsError::InvalidPath(path.to_string())),
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

/// Directories are implied by the file paths beneath them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualFileSystem {
    files: BTreeMap<String, Bytes>,
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `<unit>/<path>` keyed tree, so each unit sits under its
    /// own name.
    pub fn from_tree<I>(tree: I) -> Result<Self, VfsError>
    where
        I: IntoIterator<Item = (String, Bytes)>,
    {
        let mut vfs = Self::new();
        vfs.mount("", tree)?;
        Ok(vfs)
    }

    /// Replace everything under `prefix` with `tree`.
    pub fn mount<I>(&mut self, prefix: &str, tree: I) -> Result<(), VfsError>
    where
        I: IntoIterator<Item = (String, Bytes)>,
    {
        let prefix = normalize(prefix)?;

        let mut mounted = BTreeMap::new();
        for (path, data) in tree {
            let rel = normalize(&path)?;
            if rel.is_empty() {
                return Err(VfsError::InvalidPath(path));
            }
            let full = if prefix.is_empty() {
                rel
            } else {
                format!("{}/{}", prefix, rel)
            };
            mounted.insert(full, data);
        }

        if prefix.is_empty() {
            self.files.clear();
        } else {
            let under = format!("{}/", prefix);
            self.files
                .retain(|path, _| path != &prefix && !path.starts_with(&under));
        }
        self.files.extend(mounted);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Every file, in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.files.iter().map(|(path, data)| (path.as_str(), data))
    }

    fn is_dir_normalized(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        let prefix = format!("{}/", path);
        self.files
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.stat(path).is_ok()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        normalize(path).is_ok_and(|p| self.is_dir_normalized(&p))
    }

    pub fn stat(&self, path: &str) -> Result<Metadata, VfsError> {
        let path = normalize(path)?;
        if let Some(data) = self.files.get(&path) {
            return Ok(Metadata {
                kind: EntryKind::File,
                len: data.len() as u64,
            });
        }
        if self.is_dir_normalized(&path) {
            return Ok(Metadata {
                kind: EntryKind::Dir,
                len: 0,
            });
        }
        Err(VfsError::NotFound(path))
    }

    pub fn read(&self, path: &str) -> Result<Bytes, VfsError> {
        let path = normalize(path)?;
        match self.files.get(&path) {
            Some(data) => Ok(data.clone()),
            None if self.is_dir_normalized(&path) => Err(VfsError::IsDirectory(path)),
            None => Err(VfsError::NotFound(path)),
        }
    }

    /// Open a file for reading via `std::io::Read`.
    pub fn open(&self, path: &str) -> Result<Cursor<Bytes>, VfsError> {
        self.read(path).map(Cursor::new)
    }

    /// Immediate children of `path`, sorted by name.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, VfsError> {
        let path = normalize(path)?;
        if self.files.contains_key(&path) {
            return Err(VfsError::NotDirectory(path));
        }
        if !self.is_dir_normalized(&path) {
            return Err(VfsError::NotFound(path));
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut children: BTreeMap<&str, EntryKind> = BTreeMap::new();
        for (key, _) in self.files.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => children.insert(dir, EntryKind::Dir),
                None => children.insert(rest, EntryKind::File),
            };
        }

        Ok(children
            .into_iter()
            .map(|(name, kind)| DirEntry {
                name: name.to_string(),
                kind,
            })
            .collect())
    }
}
