//! Engine configuration: defaults, YAML files and environment overrides.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use swizzle_runtime::Sel;

/// Selectors that are never intercepted: reference counting and forwarding
/// belong to the runtime.
pub const FIXED_BLACKLIST: [&str; 4] = ["retain", "release", "autorelease", "forwardInvocation:"];

pub const DEFAULT_SUBCLASS_PREFIX: &str = "Swizzle_";

/// Path of a YAML config file.
pub const CONFIG_ENV: &str = "SWIZZLE_CONFIG";
/// Overrides `subclass_prefix`.
pub const PREFIX_ENV: &str = "SWIZZLE_SUBCLASS_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Private subclasses are named `<prefix><BaseClass>`.
    pub subclass_prefix: String,
    /// Selectors rejected in addition to [`FIXED_BLACKLIST`].
    pub blacklist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subclass_prefix: DEFAULT_SUBCLASS_PREFIX.to_string(),
            blacklist: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        log::debug!("loading interceptor config from {}", path.display());
        Self::from_yaml(&contents)
    }

    /// Reads `SWIZZLE_CONFIG` when set, then applies `SWIZZLE_SUBCLASS_PREFIX`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(Path::new(&path))?,
            None => Self::default(),
        };
        if let Ok(prefix) = std::env::var(PREFIX_ENV) {
            config.subclass_prefix = prefix;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.subclass_prefix;
        let valid = prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(ConfigError::InvalidPrefix(prefix.clone()));
        }
        Ok(())
    }

    pub fn is_blacklisted(&self, sel: Sel) -> bool {
        let name = sel.name();
        FIXED_BLACKLIST.contains(&name) || self.blacklist.iter().any(|s| s == name)
    }

    pub fn subclass_name(&self, base: &str) -> String {
        format!("{}{}", self.subclass_prefix, base)
    }
}
