use std::{fs, path::Path};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Tuning knobs for a `Database`. Missing fields in a JSON document fall back
/// to the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Promote the log into a new level once it grows past this many bytes.
    pub max_log_size: u64,
    /// Compact every level into one once there are more than this many.
    pub max_levels: usize,
    /// Resolved point lookups remembered per level. Zero disables the cache.
    pub cache_capacity: usize,
    /// Index every n-th record of a level; 1 indexes every key.
    pub index_interval: usize,
    /// fsync the log after every append.
    pub sync_writes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_log_size: 1_000_000,
            max_levels: 8,
            cache_capacity: 1000,
            index_interval: 1,
            sync_writes: false,
        }
    }
}

impl Options {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        let options: Options = serde_json::from_str(s)?;
        options.validate()?;
        Ok(options)
    }

    pub fn load<P>(path: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading options from {}", path.as_ref().display()))?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_levels == 0 {
            bail!("max_levels must be at least 1");
        }
        if self.index_interval == 0 {
            bail!("index_interval must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Options;

    #[test]
    fn test_partial_json() {
        let options = Options::from_json(r#"{"max_log_size": 4096, "sync_writes": true}"#).unwrap();
        assert_eq!(4096, options.max_log_size);
        assert!(options.sync_writes);
        assert_eq!(Options::default().max_levels, options.max_levels);
        assert_eq!(Options::default().cache_capacity, options.cache_capacity);
    }

    #[test]
    fn test_rejects_zero_levels() {
        assert!(Options::from_json(r#"{"max_levels": 0}"#).is_err());
        assert!(Options::from_json(r#"{"index_interval": 0}"#).is_err());
    }

    #[test]
    fn test_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("options.json");
        std::fs::write(&path, serde_json::to_string(&Options::default())?)?;
        assert_eq!(Options::default(), Options::load(&path)?);
        Ok(())
    }
}
