//! Bootstrap configuration for an entry point.
//!
//! Validation happens once, before the runtime starts; the core only ever
//! sees an already-validated [`EntryPointConfig`]. The environment inputs
//! are `APP_ENTRY_POINT_NAME` and `APP_ENVIRONMENT`.

use std::fmt;
use std::str::FromStr;

/// Runtime environment of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
    Test,
}

impl Environment {
    /// Stable lowercase label as accepted by `APP_ENVIRONMENT`.
    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Production => "prod",
            Environment::Development => "dev",
            Environment::Test => "test",
        }
    }

    /// Whether verbose diagnostics should be enabled.
    pub fn is_debug(self) -> bool {
        !matches!(self, Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = ConfigurationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(Environment::Production),
            "dev" | "development" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => Err(ConfigurationError::CheckFailed(format!(
                "unknown environment '{other}' (expected prod, dev, or test)"
            ))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised only at bootstrap; never at runtime.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("configuration check failed: {0}")]
    CheckFailed(String),
}

/// The validated `{entry_point_name, environment}` pair the core receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointConfig {
    entry_point_name: String,
    environment: Environment,
}

impl EntryPointConfig {
    /// Build a config, rejecting empty entry point names.
    pub fn new(
        entry_point_name: impl Into<String>,
        environment: Environment,
    ) -> Result<Self, ConfigurationError> {
        let entry_point_name = entry_point_name.into();
        if entry_point_name.trim().is_empty() {
            return Err(ConfigurationError::CheckFailed(
                "entry point name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            entry_point_name,
            environment,
        })
    }

    /// Read and validate `APP_ENTRY_POINT_NAME` and `APP_ENVIRONMENT`.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let name = std::env::var("APP_ENTRY_POINT_NAME").map_err(|_| {
            ConfigurationError::CheckFailed("APP_ENTRY_POINT_NAME is not set".to_string())
        })?;
        let environment = std::env::var("APP_ENVIRONMENT")
            .map_err(|_| {
                ConfigurationError::CheckFailed("APP_ENVIRONMENT is not set".to_string())
            })?
            .parse()?;
        Self::new(name, environment)
    }

    pub fn entry_point_name(&self) -> &str {
        &self.entry_point_name
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_known_labels() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
        assert_eq!(" Test ".parse::<Environment>().unwrap(), Environment::Test);
    }

    #[test]
    fn environment_rejects_unknown_labels() {
        let err = "staging".parse::<Environment>().unwrap_err();
        assert!(err.to_string().contains("staging"));
    }

    #[test]
    fn debug_flag_follows_environment() {
        assert!(!Environment::Production.is_debug());
        assert!(Environment::Development.is_debug());
        assert!(Environment::Test.is_debug());
    }

    #[test]
    fn config_rejects_empty_name() {
        let err = EntryPointConfig::new("  ", Environment::Test).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn config_exposes_validated_pair() {
        let config = EntryPointConfig::new("billing", Environment::Production).unwrap();
        assert_eq!(config.entry_point_name(), "billing");
        assert_eq!(config.environment(), Environment::Production);
    }
}
