use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use chrono::FixedOffset;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse a config from YAML text: expand `$env{...}` references, deserialize,
/// expand `~` in paths and validate.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;

    config.storage.artifacts = expand_tilde(&config.storage.artifacts);
    config.storage.state = expand_tilde(&config.storage.state);

    validate_config(&config)?;

    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let unexpanded = unexpanded_env_vars(yaml_string);

    match unexpanded.len() {
        0 => Ok(()),
        1 => Err(ConfigError::Validation(format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             Set it (export {0}=...) or replace $env{{{0}}} in the config file with a value",
            unexpanded[0]
        ))),
        _ => Err(ConfigError::Validation(format!(
            "Environment variables are not set: {}",
            unexpanded.join(", ")
        ))),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.provider.api_key.trim().is_empty() {
        errors.push("provider.api_key must not be empty".to_string());
    }
    if config.provider.api_secret.trim().is_empty() {
        errors.push("provider.api_secret must not be empty".to_string());
    }
    if reqwest::Url::parse(&config.provider.api_url).is_err() {
        errors.push(format!(
            "provider.api_url '{}' is not a valid URL",
            config.provider.api_url
        ));
    }

    if config.dispatch.tps == 0 {
        errors.push("dispatch.tps must be at least 1".to_string());
    }
    if config.dispatch.concurrency == 0 {
        errors.push("dispatch.concurrency must be at least 1".to_string());
    }
    if config.dispatch.max_throttle_retries == Some(0) {
        errors.push("dispatch.max_throttle_retries must be at least 1 when set".to_string());
    }

    if let Some(start) = config.window.start {
        if start >= config.window.end {
            errors.push(format!(
                "window.start ({}) must be before window.end ({})",
                start, config.window.end
            ));
        }
    }
    if FixedOffset::east_opt(config.window.utc_offset_minutes * 60).is_none() {
        errors.push(format!(
            "window.utc_offset_minutes {} is out of range",
            config.window.utc_offset_minutes
        ));
    }
    if config.window.days.is_empty() {
        errors.push("window.days must name at least one weekday".to_string());
    }
    if !(config.window.safety_factor > 0.0 && config.window.safety_factor <= 1.0) {
        errors.push(format!(
            "window.safety_factor {} must be in (0, 1]",
            config.window.safety_factor
        ));
    }

    let batches = &config.batches;
    if !batches.delimiter.is_ascii() {
        errors.push("batches.delimiter must be an ASCII character".to_string());
    }
    for (name, prefix) in [
        ("pending_prefix", &batches.pending_prefix),
        ("archive_prefix", &batches.archive_prefix),
        ("output_prefix", &batches.output_prefix),
    ] {
        if prefix.is_empty() {
            errors.push(format!("batches.{} must not be empty", name));
        }
    }
    if batches.pending_prefix == batches.archive_prefix
        || batches.pending_prefix == batches.output_prefix
    {
        errors.push(
            "batches.pending_prefix must differ from archive_prefix and output_prefix"
                .to_string(),
        );
    }

    if config.lock.lease.is_zero() {
        errors.push("lock.lease must be positive".to_string());
    }
    if let Some(keep_alive) = config.lock.keep_alive {
        if keep_alive.is_zero() || keep_alive >= config.lock.lease {
            errors.push("lock.keep_alive must be positive and shorter than lock.lease".to_string());
        }
    }

    if let Err(e) = cron::Schedule::from_str(&config.trigger.schedule) {
        errors.push(format!(
            "trigger.schedule '{}' is not a valid cron expression: {}",
            config.trigger.schedule, e
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}
