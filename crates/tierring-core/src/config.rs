//! Ring reader configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RingError, RingResult};
use crate::hash::PathHasher;

/// Settings shared by every process that reads rings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Salt prepended to every hashed path.
    pub hash_path_prefix: String,
    /// Salt appended to every hashed path.
    pub hash_path_suffix: String,
    /// Minimum seconds between checks of a ring file's modification time.
    pub reload_interval_secs: u64,
    /// Directory holding `<name>.ring.gz` files.
    pub swift_dir: PathBuf,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            hash_path_prefix: String::new(),
            hash_path_suffix: String::new(),
            reload_interval_secs: 15,
            swift_dir: PathBuf::from("/etc/swift"),
        }
    }
}

impl RingConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> RingResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| RingError::Config(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| RingError::Config(e.to_string())),
            _ => Err(RingError::Config(format!(
                "Unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Rejects configs that cannot hash paths safely.
    pub fn validate(&self) -> RingResult<()> {
        if self.hash_path_prefix.is_empty() && self.hash_path_suffix.is_empty() {
            return Err(RingError::Config(
                "hash_path_prefix or hash_path_suffix must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between ring file checks.
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    /// Path of the ring named `name`, e.g. `object` -> `<swift_dir>/object.ring.gz`.
    pub fn ring_path(&self, name: &str) -> PathBuf {
        self.swift_dir.join(format!("{}.ring.gz", name))
    }

    /// Path hasher using the configured salts.
    pub fn hasher(&self) -> PathHasher {
        PathHasher::new(self.hash_path_prefix.clone(), self.hash_path_suffix.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = RingConfig::default();
        assert_eq!(config.reload_interval(), Duration::from_secs(15));
        assert_eq!(config.swift_dir, PathBuf::from("/etc/swift"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
hash_path_suffix = "changeme"
reload_interval_secs = 3
swift_dir = "/srv/rings"
"#
        )
        .unwrap();

        let config = RingConfig::from_file(file.path()).unwrap();
        assert_eq!(config.hash_path_suffix, "changeme");
        assert_eq!(config.hash_path_prefix, "");
        assert_eq!(config.reload_interval_secs, 3);
        assert_eq!(config.ring_path("object"), PathBuf::from("/srv/rings/object.ring.gz"));
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".JSON").unwrap();
        writeln!(file, r#"{{"hash_path_prefix": "start"}}"#).unwrap();

        let config = RingConfig::from_file(file.path()).unwrap();
        assert_eq!(config.hash_path_prefix, "start");
        assert_eq!(config.reload_interval_secs, 15);
        assert_eq!(config.hasher(), PathHasher::new("start", ""));
    }

    #[test]
    fn test_from_file_errors() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            RingConfig::from_file(file.path()),
            Err(RingError::Config(_))
        ));

        let mut bad = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(bad, "reload_interval_secs = \"soon\"").unwrap();
        assert!(matches!(
            RingConfig::from_file(bad.path()),
            Err(RingError::Config(_))
        ));

        assert!(matches!(
            RingConfig::from_file(Path::new("/nonexistent/ring.toml")),
            Err(RingError::Io(_))
        ));
    }
}
