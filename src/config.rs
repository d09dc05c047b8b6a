//! Optional TOML configuration.
//!
//! Location: `$XDG_CONFIG_HOME/srctunnel/config.toml` (or the platform
//! equivalent). Every field can be overridden on the command line.
//!
//! ```toml
//! relay = "relay.example.com:7070"
//! listen = "0.0.0.0:7070"
//! roots = ["~/src", "~/work/src"]
//! std_root = "/usr/lib/srctunnel/std"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Workspace roots searched by the agent, in order
    pub roots: Vec<PathBuf>,
    pub std_root: Option<PathBuf>,
    /// Relay address the agent dials
    pub relay: Option<String>,
    /// Address the consumer accepts agents on
    pub listen: Option<String>,
}

impl Config {
    /// Default config file path, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("srctunnel").join("config.toml"))
    }

    /// Load `path`, or the default path when `None`. A missing default file
    /// yields an empty config; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::debug!("Loaded config from {}", path.display());

        Ok(config.expanded())
    }

    fn expanded(mut self) -> Self {
        self.roots = self.roots.iter().map(|r| expand_tilde(r)).collect();
        self.std_root = self.std_root.as_deref().map(expand_tilde);
        self
    }
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_explicit_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            "relay = \"127.0.0.1:7070\"\nroots = [\"/src\", \"~/work\"]\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.relay.as_deref(), Some("127.0.0.1:7070"));
        assert_eq!(config.roots[0], PathBuf::from("/src"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.roots[1], home.join("work"));
        }
        assert_eq!(config.listen, None);
    }

    #[test]
    fn test_missing_explicit_file_errors() {
        let tmp = TempDir::new().unwrap();
        assert!(Config::load(Some(&tmp.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(&path, "relays = \"x\"\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde(Path::new("/abs")), PathBuf::from("/abs"));
        assert_eq!(expand_tilde(Path::new("rel/~")), PathBuf::from("rel/~"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/src")), home.join("src"));
            assert_eq!(expand_tilde(Path::new("~")), home);
        }
    }
}
