//! Plugin-level configuration handed to the manager at `init`.
//!
//! This mirrors the directory set the host provisions for a channel plugin
//! plus the few knobs the manager itself owns. Loading is TOML via serde;
//! every field has a default so an empty file (or [`PluginConfig::default`])
//! is valid. The `CALYX_ENCODING_MODE` env var overrides the framing mode.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ManagerError;
use crate::types::EncodingMode;

/// Configuration for one channel-plugin instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginConfig {
    /// Read-only provisioning files for this channel.
    pub etc_directory: PathBuf,
    /// Where the plugin may write log artifacts.
    pub logging_directory: PathBuf,
    /// Scratch space, wiped across runs.
    pub tmp_directory: PathBuf,
    /// Persistent auxiliary data.
    pub aux_data_directory: PathBuf,
    /// Directory the plugin binaries were loaded from.
    pub plugin_directory: PathBuf,
    /// Wire framing policy for this manager instance.
    pub encoding_mode: EncodingMode,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            etc_directory: PathBuf::from("etc"),
            logging_directory: PathBuf::from("log"),
            tmp_directory: PathBuf::from("tmp"),
            aux_data_directory: PathBuf::from("aux"),
            plugin_directory: PathBuf::from("plugins"),
            encoding_mode: EncodingMode::default(),
        }
    }
}

impl PluginConfig {
    /// Load from a TOML file, then apply env overrides.
    pub fn load_from_path(path: &Path) -> Result<Self, ManagerError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ManagerError::Config(format!("read {}: {e}", path.display()))
        })?;
        let mut config: PluginConfig = toml::from_str(&raw)
            .map_err(|e| ManagerError::Config(format!("parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("CALYX_ENCODING_MODE") {
            match mode.as_str() {
                "single" => self.encoding_mode = EncodingMode::Single,
                "batch" => self.encoding_mode = EncodingMode::Batch,
                "fragment-single-producer" => {
                    self.encoding_mode = EncodingMode::FragmentSingleProducer
                }
                "fragment-multiple-producer" => {
                    self.encoding_mode = EncodingMode::FragmentMultipleProducer
                }
                other => {
                    tracing::warn!(mode = %other, "ignoring unrecognised CALYX_ENCODING_MODE");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_are_complete() {
        let config = PluginConfig::default();
        assert_eq!(config.encoding_mode, EncodingMode::FragmentSingleProducer);
        assert_eq!(config.etc_directory, PathBuf::from("etc"));
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let config: PluginConfig = toml::from_str("").unwrap();
        assert_eq!(config.plugin_directory, PathBuf::from("plugins"));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "etc_directory = \"/data/etc\"\nencoding_mode = \"batch\""
        )
        .unwrap();

        let config = PluginConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.etc_directory, PathBuf::from("/data/etc"));
        assert_eq!(config.encoding_mode, EncodingMode::Batch);
        // untouched fields keep their defaults
        assert_eq!(config.tmp_directory, PathBuf::from("tmp"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<PluginConfig>("no_such_key = 1").unwrap_err();
        assert!(err.to_string().contains("no_such_key"));
    }

    #[test]
    fn missing_file_errors() {
        let err = PluginConfig::load_from_path(Path::new("/definitely/missing.toml"));
        assert!(matches!(err, Err(ManagerError::Config(_))));
    }
}
