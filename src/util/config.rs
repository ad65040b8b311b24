//! Configuration file support for unimem.
//!
//! unimem supports two configuration file locations:
//! - Global: `~/.unimem/config.toml` - User-wide defaults
//! - Project: `.unimem/config.toml` - Project-specific overrides
//!
//! Project config takes precedence over global config.
//!
//! ```toml
//! [loader]
//! force_intercept = false
//!
//! [[loader.adapters]]
//! name = "level_zero"
//! paths = ["/opt/intel/lib/libunimem_adapter_l0.so", "libunimem_adapter_l0.so"]
//!
//! [[providers]]
//! tag = "host"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::capability::ProviderConfig;

/// unimem configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Adapter discovery settings
    pub loader: LoaderConfig,

    /// Provider configurations to create on demand
    pub providers: Vec<ProviderConfig>,
}

/// Adapter discovery settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Force multi-backend interception regardless of how many adapters load
    pub force_intercept: Option<bool>,

    /// Adapter families in priority order
    pub adapters: Vec<AdapterFamily>,
}

/// One logical adapter family: candidate libraries tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterFamily {
    /// Family name, also the capability tag suffix (`adapter:<name>`)
    pub name: String,

    /// Candidate library paths or glob patterns
    #[serde(default)]
    pub paths: Vec<String>,
}

impl AdapterFamily {
    pub fn new(name: impl Into<String>) -> Self {
        AdapterFamily {
            name: name.into(),
            paths: Vec::new(),
        }
    }

    /// Append a candidate path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.push(path.into());
        self
    }
}

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Load configuration with fallback to defaults if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            Self::load(path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {}: {:#}", path.display(), e);
                Self::default()
            })
        } else {
            Self::default()
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory: {}", parent.display())
            })?;
        }

        let contents =
            toml::to_string_pretty(self).with_context(|| "failed to serialize config")?;

        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Merge another config into this one (other takes precedence).
    ///
    /// Lists are replaced, not appended: a project that lists adapters
    /// defines the whole search path.
    pub fn merge(&mut self, other: Config) {
        if other.loader.force_intercept.is_some() {
            self.loader.force_intercept = other.loader.force_intercept;
        }
        if !other.loader.adapters.is_empty() {
            self.loader.adapters = other.loader.adapters;
        }
        if !other.providers.is_empty() {
            self.providers = other.providers;
        }
    }
}

/// Load merged configuration from global and project locations.
///
/// Order of precedence (highest to lowest):
/// 1. Project config (.unimem/config.toml)
/// 2. Global config (~/.unimem/config.toml)
/// 3. Defaults
pub fn load_config(global_path: &Path, project_path: &Path) -> Config {
    let mut config = Config::default();

    if global_path.exists() {
        let global = Config::load_or_default(global_path);
        config.merge(global);
    }

    if project_path.exists() {
        let project = Config::load_or_default(project_path);
        config.merge(project);
    }

    config
}

/// Get the global unimem config directory (~/.unimem).
pub fn global_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".unimem"))
}

/// Get the global config path (~/.unimem/config.toml).
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the project config path (.unimem/config.toml).
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(".unimem").join("config.toml")
}

/// Load the effective configuration for a project directory.
pub fn discover_config(project_root: &Path) -> Config {
    let project = project_config_path(project_root);
    match global_config_path() {
        Some(global) => load_config(&global, &project),
        None => load_config(Path::new(""), &project),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capability::CapabilityTag;
    use crate::test_support::{write_config, LOADER_CONFIG};
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.loader.force_intercept.is_none());
        assert!(config.loader.adapters.is_empty());
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_config_load() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(tmp.path(), "config.toml", LOADER_CONFIG);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.loader.force_intercept, Some(false));
        assert_eq!(config.loader.adapters.len(), 2);
        assert_eq!(config.loader.adapters[0].name, "level_zero");
        assert_eq!(
            config.loader.adapters[0].paths,
            vec!["/opt/l0/libunimem_adapter_l0.so", "libunimem_adapter_l0.so"]
        );
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].tag, CapabilityTag::adapter("level_zero"));
        assert_eq!(config.providers[1].device.as_deref(), Some("Arc A770"));
    }

    #[test]
    fn test_config_load_invalid_falls_back() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(tmp.path(), "config.toml", "[loader\nbroken");

        assert!(Config::load(&path).is_err());
        let config = Config::load_or_default(&path);
        assert!(config.loader.adapters.is_empty());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        base.loader.force_intercept = Some(true);
        base.loader.adapters = vec![AdapterFamily::new("cuda").with_path("libcuda_adapter.so")];

        let mut override_cfg = Config::default();
        override_cfg.providers = vec![ProviderConfig::new(CapabilityTag::Host)];

        base.merge(override_cfg);

        assert_eq!(base.loader.force_intercept, Some(true)); // Not overridden
        assert_eq!(base.loader.adapters.len(), 1);
        assert_eq!(base.providers.len(), 1);
    }

    #[test]
    fn test_config_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.loader.adapters = vec![AdapterFamily::new("hip").with_path("/opt/rocm/lib/*.so")];
        config.providers = vec![ProviderConfig::new(CapabilityTag::Shared).with_param("dir", "/dev/shm")];
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.loader.adapters, config.loader.adapters);
        assert_eq!(loaded.providers[0].tag, CapabilityTag::Shared);
        assert_eq!(loaded.providers[0].param_str("dir"), Some("/dev/shm"));
    }

    #[test]
    fn test_load_config_precedence() {
        let tmp = TempDir::new().unwrap();
        let global = write_config(
            tmp.path(),
            "global.toml",
            r#"
[loader]
force_intercept = true

[[loader.adapters]]
name = "cuda"
paths = ["libcuda_adapter.so"]
"#,
        );
        let project = write_config(
            tmp.path(),
            "project.toml",
            r#"
[[loader.adapters]]
name = "level_zero"
paths = ["libl0_adapter.so"]
"#,
        );

        let config = load_config(&global, &project);

        // Project adapters replace global ones
        assert_eq!(config.loader.adapters.len(), 1);
        assert_eq!(config.loader.adapters[0].name, "level_zero");
        // Global override is preserved
        assert_eq!(config.loader.force_intercept, Some(true));
    }

    #[test]
    fn test_project_config_path() {
        let path = project_config_path(Path::new("/work/app"));
        assert_eq!(path, PathBuf::from("/work/app/.unimem/config.toml"));
    }
}
