use crate::constants::{
    DEFAULT_ATTACK_TIMEOUT_SECS, DEFAULT_ATTACK_URL, DEFAULT_INPUT_CONTROLS, DEFAULT_INPUT_MAPPINGS,
    DEFAULT_OUTPUT_CONTROLS, DEFAULT_OUTPUT_MAPPINGS,
};
use crate::error::{ConverterError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Optional TOML configuration; every field falls back to a built-in default
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub attack: AttackConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_controls: Option<PathBuf>,
    pub input_mappings: Option<PathBuf>,
    pub output_controls: Option<PathBuf>,
    pub output_mappings: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    pub url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
}

/// Values given on the command line (or via environment); these win over the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub input_controls: Option<PathBuf>,
    pub input_mappings: Option<PathBuf>,
    pub output_controls: Option<PathBuf>,
    pub output_mappings: Option<PathBuf>,
    pub attack_data: Option<String>,
}

/// Fully resolved run settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub input_controls: PathBuf,
    pub input_mappings: PathBuf,
    pub output_controls: PathBuf,
    pub output_mappings: PathBuf,
    pub attack_data: String,
    pub attack_timeout: Duration,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path).map_err(|e| {
            ConverterError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.attack.timeout_seconds == Some(0) {
            return Err(ConverterError::Config("attack.timeout_seconds must be positive".to_string()));
        }
        Ok(config)
    }

    pub fn resolve(&self, overrides: Overrides) -> Settings {
        let pick = |cli: Option<PathBuf>, file: &Option<PathBuf>, default: &str| {
            cli.or_else(|| file.clone()).unwrap_or_else(|| PathBuf::from(default))
        };
        Settings {
            input_controls: pick(overrides.input_controls, &self.paths.input_controls, DEFAULT_INPUT_CONTROLS),
            input_mappings: pick(overrides.input_mappings, &self.paths.input_mappings, DEFAULT_INPUT_MAPPINGS),
            output_controls: pick(overrides.output_controls, &self.paths.output_controls, DEFAULT_OUTPUT_CONTROLS),
            output_mappings: pick(overrides.output_mappings, &self.paths.output_mappings, DEFAULT_OUTPUT_MAPPINGS),
            attack_data: overrides
                .attack_data
                .or_else(|| self.attack.url.clone())
                .unwrap_or_else(|| DEFAULT_ATTACK_URL.to_string()),
            attack_timeout: Duration::from_secs(
                self.attack.timeout_seconds.unwrap_or(DEFAULT_ATTACK_TIMEOUT_SECS),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let settings = Config::load(None).unwrap().resolve(Overrides::default());
        assert_eq!(settings.input_controls, PathBuf::from(DEFAULT_INPUT_CONTROLS));
        assert_eq!(settings.output_mappings, PathBuf::from(DEFAULT_OUTPUT_MAPPINGS));
        assert_eq!(settings.attack_data, DEFAULT_ATTACK_URL);
        assert_eq!(settings.attack_timeout, Duration::from_secs(DEFAULT_ATTACK_TIMEOUT_SECS));
    }

    #[test]
    fn test_cli_beats_file_beats_default() {
        let config = Config::from_toml(
            r#"
            [paths]
            input_controls = "from-file.tsv"
            output_controls = "out/controls.json"

            [attack]
            url = "attack/enterprise-attack.json"
            timeout_seconds = 5

            [logging]
            log_dir = "logs"
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("logs")));

        let settings = config.resolve(Overrides {
            input_controls: Some(PathBuf::from("from-cli.tsv")),
            ..Overrides::default()
        });
        assert_eq!(settings.input_controls, PathBuf::from("from-cli.tsv"));
        assert_eq!(settings.output_controls, PathBuf::from("out/controls.json"));
        assert_eq!(settings.input_mappings, PathBuf::from(DEFAULT_INPUT_MAPPINGS));
        assert_eq!(settings.attack_data, "attack/enterprise-attack.json");
        assert_eq!(settings.attack_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Config::from_toml("[attack]\ntimeout_seconds = 0\n").is_err());
        assert!(Config::from_toml("[paths\n").is_err());
        assert!(Config::load(Some(Path::new("/nonexistent/control_mappings.toml"))).is_err());
    }
}
