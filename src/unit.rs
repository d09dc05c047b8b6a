//! Compilation units and the resolver seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::ResolveError;

/// Name of the pseudo-unit standing for native/foreign interop.
/// It never has files and is skipped during closure collection.
pub const NATIVE_INTEROP_UNIT: &str = "C";

/// A compilation unit plus whether its test-only files and imports are included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub name: String,
    pub include_tests: bool,
}

impl UnitId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            include_tests: false,
        }
    }

    pub fn with_tests(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            include_tests: true,
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.include_tests {
            write!(f, "{} [+tests]", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Build parameters forwarded to the resolver. Opaque to the protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParams {
    pub target_os: String,
    pub target_arch: String,
    pub tags: Vec<String>,
}

impl BuildParams {
    /// Parameters describing the current host.
    pub fn host() -> Self {
        Self {
            target_os: std::env::consts::OS.to_string(),
            target_arch: std::env::consts::ARCH.to_string(),
            tags: Vec::new(),
        }
    }
}

/// Result of resolving one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUnit {
    /// Canonical unit name
    pub name: String,
    /// Directory backing the unit
    pub dir: PathBuf,
    /// Files relative to `dir`, slash-separated. Includes test files when requested.
    pub files: Vec<String>,
    /// Direct imports. Includes test imports when requested.
    pub imports: Vec<String>,
    /// Whether the unit lives under the standard/builtin root
    pub is_standard_library: bool,
}

/// Turns a unit name into its files and direct imports.
pub trait UnitResolver: Send + Sync {
    /// Resolve `id`. Test-only files and imports are returned only when
    /// `id.include_tests` is set.
    fn resolve(&self, id: &UnitId, params: &BuildParams) -> Result<ResolvedUnit, ResolveError>;

    /// Every unit available to consumers.
    fn list_units(&self) -> Result<Vec<String>, ResolveError>;
}
