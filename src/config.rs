//! A narrow, read-only reader for the handful of `core.*` keys the
//! object storage engine consumes. Full git-config parsing (includes,
//! multi-valued keys, conditional sections) is out of scope; this reads
//! `[section]` / `key = value` pairs line by line in the same style the
//! rest of this crate parses on-disk formats.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{OdbError, Result};

/// Default soft cap on resident window bytes (1 GiB).
pub const DEFAULT_PACKED_GIT_LIMIT: u64 = 1 << 30;
/// Default window granularity (32 KiB), matches stock Git on mmap-capable platforms.
pub const DEFAULT_WINDOW_SIZE: usize = 32 * 1024;
/// Default soft cap on concurrently open pack files.
pub const DEFAULT_OPEN_FILES: usize = 64;
/// Default byte budget for the delta base cache, per spec component default.
pub const DEFAULT_DELTA_BASE_CACHE_LIMIT: u64 = 10 * 1024 * 1024;
/// Default zlib compression level used when writing loose objects.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

#[derive(Debug, Clone)]
pub struct Config {
    pub packed_git_limit: u64,
    pub packed_git_window_size: usize,
    pub packed_git_open_files: usize,
    pub packed_git_mmap: bool,
    pub delta_base_cache_limit: u64,
    pub compression_level: u32,
    pub repository_format_version: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packed_git_limit: DEFAULT_PACKED_GIT_LIMIT,
            packed_git_window_size: DEFAULT_WINDOW_SIZE,
            packed_git_open_files: DEFAULT_OPEN_FILES,
            packed_git_mmap: true,
            delta_base_cache_limit: DEFAULT_DELTA_BASE_CACHE_LIMIT,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            repository_format_version: 0,
        }
    }
}

impl Config {
    /// Read `core.*` keys from a git-config-shaped file. Missing file is
    /// not an error: callers get the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(err) => return Err(OdbError::Io(err)),
        };

        let core = Self::parse_core_section(&contents);
        if let Some(v) = core.get("packedgitlimit") {
            config.packed_git_limit = parse_bytes(v)?;
        }
        if let Some(v) = core.get("packedgitwindowsize") {
            config.packed_git_window_size = parse_bytes(v)? as usize;
            if !config.packed_git_window_size.is_power_of_two() || config.packed_git_window_size < 4096 {
                return Err(OdbError::UnsupportedFormat(format!(
                    "core.packedGitWindowSize must be a power of two >= 4096, got {}",
                    config.packed_git_window_size
                )));
            }
        }
        if let Some(v) = core.get("packedgitopenfiles") {
            config.packed_git_open_files = v.parse().map_err(|_| {
                OdbError::UnsupportedFormat(format!("invalid core.packedGitOpenFiles: {v}"))
            })?;
        }
        if let Some(v) = core.get("packedgitmmap") {
            config.packed_git_mmap = parse_bool(v)?;
        }
        if let Some(v) = core.get("deltabasecachelimit") {
            config.delta_base_cache_limit = parse_bytes(v)?;
        }
        if let Some(v) = core.get("compression") {
            config.compression_level = v.parse().map_err(|_| {
                OdbError::UnsupportedFormat(format!("invalid core.compression: {v}"))
            })?;
        }
        if let Some(v) = core.get("repositoryformatversion") {
            config.repository_format_version = v.parse().map_err(|_| {
                OdbError::UnsupportedFormat(format!(
                    "invalid core.repositoryFormatVersion: {v}"
                ))
            })?;
        }

        if config.repository_format_version != 0 {
            return Err(OdbError::UnsupportedFormat(format!(
                "unsupported core.repositoryFormatVersion {}",
                config.repository_format_version
            )));
        }

        Ok(config)
    }

    fn parse_core_section(contents: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        let mut in_core = false;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                in_core = line.trim_start_matches('[').trim_end_matches(']').eq_ignore_ascii_case("core");
                continue;
            }
            if !in_core {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                map.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }
        map
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(OdbError::UnsupportedFormat(format!("invalid boolean: {v}"))),
    }
}

/// Parse a size like `256m`, `1g`, or a plain byte count.
fn parse_bytes(v: &str) -> Result<u64> {
    let v = v.trim();
    let (digits, suffix) = match v.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&v[..idx], &v[idx..]),
        None => (v, ""),
    };
    let base: u64 = digits
        .parse()
        .map_err(|_| OdbError::UnsupportedFormat(format!("invalid size: {v}")))?;
    let multiplier = match suffix.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        other => {
            return Err(OdbError::UnsupportedFormat(format!("unknown size suffix: {other}")))
        }
    };
    Ok(base * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let config = Config::load("/nonexistent/path/to/config").unwrap();
        assert_eq!(config.packed_git_window_size, DEFAULT_WINDOW_SIZE);
    }

    #[test]
    fn parses_core_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(
            &path,
            "[core]\n\tpackedGitLimit = 512m\n\tpackedGitWindowSize = 8192\n\tpackedGitMMAP = false\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.packed_git_limit, 512 * 1024 * 1024);
        assert_eq!(config.packed_git_window_size, 8192);
        assert!(!config.packed_git_mmap);
    }

    #[test]
    fn rejects_non_power_of_two_window_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "[core]\n\tpackedGitWindowSize = 5000\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_nonzero_repository_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        fs::write(&path, "[core]\n\trepositoryFormatVersion = 1\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
