//! Payload store configuration.

use serde::{Deserialize, Deserializer};
use std::path::PathBuf;

/// Configuration consumed read-only by the payload store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    /// Root directory of live payloads.
    pub root: PathBuf,
    /// Directory for in-flight uploads. Must be on the same filesystem as
    /// `root` so that the final rename is atomic.
    pub tmp_dir: PathBuf,
    /// Number of two-digit shard levels.
    pub shard_depth: u32,
    /// Permission mode for created directories.
    #[serde(deserialize_with = "deserialize_mode")]
    pub dir_mode: u32,
    /// Digest algorithm name (see [`HashAlgorithm`](crate::HashAlgorithm)).
    pub hash_algorithm: String,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/payloads"),
            tmp_dir: PathBuf::from("data/tmp"),
            shard_depth: 2,
            dir_mode: 0o770,
            hash_algorithm: "sha256".to_string(),
        }
    }
}

impl PayloadConfig {
    /// Creates a configuration rooted at `root`, with the temporary
    /// directory placed next to it.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let tmp_dir = root.join(".tmp");
        Self {
            root,
            tmp_dir,
            ..Self::default()
        }
    }

    /// Sets the temporary directory.
    #[must_use]
    pub fn with_tmp_dir(mut self, tmp_dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = tmp_dir.into();
        self
    }

    /// Sets the shard depth.
    #[must_use]
    pub fn with_shard_depth(mut self, depth: u32) -> Self {
        self.shard_depth = depth;
        self
    }

    /// Sets the directory permission mode.
    #[must_use]
    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }

    /// Sets the digest algorithm name.
    #[must_use]
    pub fn with_hash_algorithm(mut self, name: impl Into<String>) -> Self {
        self.hash_algorithm = name.into();
        self
    }
}

/// Accepts either an integer or an octal string such as `"0750"`.
fn deserialize_mode<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Mode {
        Int(u32),
        Text(String),
    }

    match Mode::deserialize(deserializer)? {
        Mode::Int(mode) => Ok(mode),
        Mode::Text(text) => {
            let digits = text.trim_start_matches("0o");
            u32::from_str_radix(digits, 8).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PayloadConfig::default();
        assert_eq!(config.shard_depth, 2);
        assert_eq!(config.dir_mode, 0o770);
        assert_eq!(config.hash_algorithm, "sha256");
    }

    #[test]
    fn builder_pattern() {
        let config = PayloadConfig::new("/srv/payloads")
            .with_shard_depth(3)
            .with_dir_mode(0o700)
            .with_hash_algorithm("sha512");

        assert_eq!(config.tmp_dir, PathBuf::from("/srv/payloads/.tmp"));
        assert_eq!(config.shard_depth, 3);
        assert_eq!(config.dir_mode, 0o700);
        assert_eq!(config.hash_algorithm, "sha512");
    }
}
