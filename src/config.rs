use crate::error::{LockError, Result};
use crate::locking::{
    LockTimeoutResolution, LockTimeoutResolver, LockTimeoutValue, ResourceType, WaitStrategy,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "graphlock.toml";
pub const LOCK_TIMEOUT_ENV_VAR: &str = "GRAPHLOCK_LOCK_TIMEOUT";
pub const DEFAULT_LOCK_TIMEOUT: LockTimeoutValue = LockTimeoutValue::from_secs(30);
const DEFAULT_STRIPES: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockManagerConfig {
    #[serde(default = "default_lock_timeout")]
    pub default_timeout: LockTimeoutValue,

    #[serde(default = "default_stripes")]
    pub stripes: usize,

    #[serde(default = "default_resource_types")]
    pub resource_types: Vec<ResourceTypeConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    FailFast,
    #[default]
    Block,
    SpinThenBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeConfig {
    pub id: u32,
    pub name: String,

    #[serde(default)]
    pub strategy: StrategyKind,

    /// Falls back to `default_timeout` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<LockTimeoutValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spins: Option<u32>,
}

impl ResourceTypeConfig {
    fn wait_strategy(&self, default_timeout: LockTimeoutValue) -> Result<WaitStrategy> {
        let timeout = self.timeout.unwrap_or(default_timeout);
        match self.strategy {
            StrategyKind::FailFast => {
                if self.timeout.is_some() || self.spins.is_some() {
                    return Err(LockError::FactoryMisconfiguration(format!(
                        "resource type '{}' fails fast and takes neither a timeout nor spins",
                        self.name
                    )));
                }
                Ok(WaitStrategy::FailFast)
            }
            StrategyKind::Block => {
                if self.spins.is_some() {
                    return Err(LockError::FactoryMisconfiguration(format!(
                        "resource type '{}' blocks without spinning; use strategy \
                         \"spin_then_block\" to set spins",
                        self.name
                    )));
                }
                Ok(WaitStrategy::block(timeout))
            }
            StrategyKind::SpinThenBlock => Ok(WaitStrategy::SpinThenBlock {
                spins: self.spins.unwrap_or(0),
                timeout,
            }),
        }
    }
}

fn default_lock_timeout() -> LockTimeoutValue {
    DEFAULT_LOCK_TIMEOUT
}

fn default_stripes() -> usize {
    DEFAULT_STRIPES
}

fn default_resource_types() -> Vec<ResourceTypeConfig> {
    ["node", "relationship"]
        .into_iter()
        .zip(0..)
        .map(|(name, id)| ResourceTypeConfig {
            id,
            name: name.to_string(),
            strategy: StrategyKind::Block,
            timeout: None,
            spins: None,
        })
        .collect()
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_LOCK_TIMEOUT,
            stripes: DEFAULT_STRIPES,
            resource_types: default_resource_types(),
        }
    }
}

impl LockManagerConfig {
    /// Loads `path`, or the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file not found at {path:?}, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents).map_err(|e| {
            LockError::ConfigFile(format!("Failed to parse {}: {e}", path.display()))
        })?;

        log::debug!("Loaded config from {path:?}");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| LockError::InvalidConfig(format!("Failed to parse configuration: {e}")))
    }

    /// Effective default timeout: explicit override > `GRAPHLOCK_LOCK_TIMEOUT` > file > 30s.
    pub fn resolve_default_timeout(
        &self,
        explicit_override: Option<&str>,
    ) -> Result<LockTimeoutResolution> {
        let env_value = std::env::var(LOCK_TIMEOUT_ENV_VAR).ok();
        LockTimeoutResolver::new(
            explicit_override,
            env_value.as_deref(),
            self.default_timeout,
            DEFAULT_LOCK_TIMEOUT,
        )
        .resolve()
        .map_err(|e| LockError::InvalidConfig(e.to_string()))
    }

    pub fn resource_types(&self) -> Result<Vec<ResourceType>> {
        self.resource_types_with_override(None)
    }

    /// Builds the resource types, applying `timeout_override` to every type
    /// without an explicit timeout.
    pub fn resource_types_with_override(
        &self,
        timeout_override: Option<&str>,
    ) -> Result<Vec<ResourceType>> {
        let resolution = self.resolve_default_timeout(timeout_override)?;
        log::debug!(
            "Default lock timeout {} from {}",
            resolution.value,
            resolution.source
        );

        self.resource_types
            .iter()
            .map(|declared| {
                let strategy = declared.wait_strategy(resolution.value)?;
                Ok(ResourceType::new(
                    declared.id,
                    declared.name.as_str(),
                    strategy,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::LockTimeoutSource;
    use serial_test::serial;
    use tempfile::TempDir;

    struct EnvGuard;

    impl EnvGuard {
        fn set(value: &str) -> Self {
            unsafe {
                std::env::set_var(LOCK_TIMEOUT_ENV_VAR, value);
            }
            EnvGuard
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            unsafe {
                std::env::remove_var(LOCK_TIMEOUT_ENV_VAR);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = LockManagerConfig::default();
        assert_eq!(config.default_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.stripes, DEFAULT_STRIPES);
        assert_eq!(config.resource_types.len(), 2);
        assert_eq!(config.resource_types[1].name, "relationship");
    }

    #[test]
    fn test_load_missing_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = LockManagerConfig::load(&temp_dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config.stripes, DEFAULT_STRIPES);
    }

    #[test]
    fn test_load_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &config_path,
            r#"
default_timeout = "5s"
stripes = 16

[[resource_types]]
id = 0
name = "node"
strategy = "spin_then_block"
spins = 8

[[resource_types]]
id = 1
name = "schema"
strategy = "fail_fast"
"#,
        )
        .unwrap();

        let loaded = LockManagerConfig::load(&config_path).unwrap();
        assert_eq!(loaded.default_timeout, LockTimeoutValue::from_secs(5));
        assert_eq!(loaded.stripes, 16);
        assert_eq!(loaded.resource_types[0].strategy, StrategyKind::SpinThenBlock);
        assert_eq!(loaded.resource_types[1].strategy, StrategyKind::FailFast);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join(CONFIG_FILE_NAME);
        fs::write(&config_path, "stripes = \"many\"").unwrap();

        let err = LockManagerConfig::load(&config_path).unwrap_err();
        assert!(matches!(err, LockError::ConfigFile(_)));
    }

    #[test]
    fn test_bad_timeout_is_rejected() {
        let err = LockManagerConfig::from_toml_str(r#"default_timeout = "soon""#).unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig(_)));
    }

    #[test]
    #[serial]
    fn test_resource_types_use_default_timeout() {
        let config = LockManagerConfig::from_toml_str(
            r#"
default_timeout = "250ms"

[[resource_types]]
id = 0
name = "node"

[[resource_types]]
id = 1
name = "label"
strategy = "spin_then_block"
timeout = "infinite"
spins = 4
"#,
        )
        .unwrap();

        let types = config.resource_types().unwrap();
        assert_eq!(
            *types[0].wait_strategy(),
            WaitStrategy::block(LockTimeoutValue::from_millis(250))
        );
        assert_eq!(
            *types[1].wait_strategy(),
            WaitStrategy::SpinThenBlock {
                spins: 4,
                timeout: LockTimeoutValue::Infinite
            }
        );
    }

    #[test]
    #[serial]
    fn test_invalid_strategy_parameters() {
        let config = LockManagerConfig::from_toml_str(
            r#"
[[resource_types]]
id = 0
name = "schema"
strategy = "fail_fast"
timeout = "1s"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.resource_types(),
            Err(LockError::FactoryMisconfiguration(_))
        ));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_config() {
        let config = LockManagerConfig::from_toml_str(r#"default_timeout = "5s""#).unwrap();

        let resolution = config.resolve_default_timeout(None).unwrap();
        assert_eq!(resolution.source, LockTimeoutSource::Config);

        let _env = EnvGuard::set("100ms");
        let resolution = config.resolve_default_timeout(None).unwrap();
        assert_eq!(resolution.value, LockTimeoutValue::from_millis(100));
        assert_eq!(resolution.source, LockTimeoutSource::Environment);

        let resolution = config.resolve_default_timeout(Some("infinite")).unwrap();
        assert_eq!(resolution.value, LockTimeoutValue::Infinite);
        assert_eq!(resolution.source, LockTimeoutSource::Override);
    }
}
