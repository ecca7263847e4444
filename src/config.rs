//! Read-only configuration oracle with typed default-fallback lookup
//!
//! Daemons consult the configuration exactly once, at startup, through a
//! simple contract: ask for a key, supply the built-in default, get a value.
//! Missing keys fall back silently; malformed numeric values log a warning
//! and fall back, so a typo in a deployment file degrades to defaults rather
//! than aborting the process.
//!
//! The on-disk format is the traditional `key = value` line format with `#`
//! comments:
//!
//! ```text
//! # database connection
//! database_server = tcp://db.internal:3306
//! database_save_delay = 10000
//! ```
//!
//! # Examples
//!
//! ```rust
//! use poseidon::config::Config;
//!
//! let config = Config::from_pairs([("database_name", "game")]);
//! assert_eq!(config.get_str("database_name", "test"), "game");
//! assert_eq!(config.get_u64("database_save_delay", 5000), 5000);
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Immutable key to string table consulted at daemon startup
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    /// Creates a configuration with no entries; every lookup falls back
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads a `key = value` file
    ///
    /// Blank lines and lines starting with `#` are ignored. Lines without an
    /// `=` are skipped with a warning. Later occurrences of a key override
    /// earlier ones.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut entries = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    entries.insert(key.trim().to_owned(), value.trim().to_owned());
                }
                None => {
                    log::warn!(
                        "ignoring malformed config line {} in {}: {line}",
                        lineno + 1,
                        path.as_ref().display()
                    );
                }
            }
        }
        Ok(Self { entries })
    }

    /// Builds a configuration from key/value pairs, mainly for tests
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns the value for `key`, or `default` when absent
    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    }

    /// Returns the numeric value for `key`, or `default` when absent or
    /// unparsable
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.entries.get(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!("config key {key} has non-numeric value {raw:?}, using {default}");
                default
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let config = Config::empty();
        assert_eq!(
            config.get_str("database_server", "tcp://localhost:3306"),
            "tcp://localhost:3306"
        );
        assert_eq!(config.get_u64("database_max_reconn_delay", 60000), 60000);
    }

    #[test]
    fn test_malformed_number_falls_back() {
        let config = Config::from_pairs([("database_save_delay", "soon")]);
        assert_eq!(config.get_u64("database_save_delay", 5000), 5000);
    }

    #[test]
    fn test_file_parsing_skips_comments_and_blanks() {
        let mut path = std::env::temp_dir();
        path.push(format!("poseidon-config-test-{}", std::process::id()));
        let text = "# header\n\ndatabase_name = game \n database_username=admin\nnot a pair\n";
        fs::write(&path, text).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.get_str("database_name", "test"), "game");
        assert_eq!(config.get_str("database_username", "root"), "admin");
        assert_eq!(config.get_str("not a pair", "absent"), "absent");

        let _ = fs::remove_file(&path);
    }
}
