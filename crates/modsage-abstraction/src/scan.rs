//! Scan results produced by the directory scanner.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file discovered during a scan (mod jar, resource pack, or any other file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedFile {
    /// File name.
    pub name: String,
    /// Path relative to the scan root.
    pub relative_path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// A configuration file discovered during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// File name.
    pub name: String,
    /// Path relative to the scan root.
    pub relative_path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Short text preview of the file's content.
    #[serde(default)]
    pub preview: Option<String>,
    /// Language tag of the configuration format (e.g. "toml", "json").
    #[serde(default)]
    pub language: Option<String>,
}

/// Everything the scanner found under one directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    /// Root of the scan.
    pub scan_path: PathBuf,
    /// When the scan ran.
    pub timestamp: DateTime<Utc>,
    /// All files seen.
    #[serde(default)]
    pub files: Vec<ScannedFile>,
    /// Mod archives.
    #[serde(default)]
    pub mods: Vec<ScannedFile>,
    /// Configuration files.
    #[serde(default)]
    pub configs: Vec<ConfigFile>,
    /// Resource packs.
    #[serde(default)]
    pub resource_packs: Vec<ScannedFile>,
    /// Errors reported while scanning.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Warnings reported while scanning.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Markdown report rendered by the scanner.
    #[serde(default)]
    pub report: String,
}

impl ScanResult {
    /// Creates an empty scan result for `scan_path`, timestamped now.
    pub fn empty(scan_path: impl Into<PathBuf>) -> Self {
        Self {
            scan_path: scan_path.into(),
            timestamp: Utc::now(),
            files: Vec::new(),
            mods: Vec::new(),
            configs: Vec::new(),
            resource_packs: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            report: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_result_deserialize_minimal() {
        let json = r#"{"scan_path": "/srv/pack", "timestamp": "2026-01-01T00:00:00Z"}"#;
        let scan: ScanResult = serde_json::from_str(json).unwrap();
        assert_eq!(scan.scan_path, PathBuf::from("/srv/pack"));
        assert!(scan.mods.is_empty());
        assert!(scan.configs.is_empty());
        assert!(scan.report.is_empty());
    }

    #[test]
    fn test_config_file_optional_fields() {
        let json = r#"{
            "name": "sodium.json",
            "relative_path": "config/sodium.json",
            "size": 512,
            "modified": "2026-01-01T00:00:00Z"
        }"#;
        let config: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(config.preview, None);
        assert_eq!(config.language, None);
    }
}
