use std::collections::HashSet;

use crate::stream::reasoning::KNOWN_REASONING_FIELDS;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_upstream(config)?;
    validate_transport(config)?;
    validate_stream_settings(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    if upstream.provider.trim().is_empty() {
        return Err(validation_err("upstream.provider cannot be empty"));
    }
    if upstream.model.trim().is_empty() {
        return Err(validation_err("upstream.model cannot be empty"));
    }
    if upstream.api_key.trim().is_empty() {
        return Err(validation_err("upstream.api_key cannot be empty"));
    }
    validate_http_url("base_url", &upstream.base_url)?;
    if let Some(proxy) = upstream.proxy.as_deref() {
        if proxy.trim().is_empty() {
            return Err(validation_err("upstream.proxy cannot be empty when set"));
        }
        validate_http_url("proxy", proxy)?;
    }
    Ok(())
}

fn validate_http_url(field_name: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value.trim()).map_err(|err| {
        validation_err(format!("upstream.{field_name} is not a valid URL: {err}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "upstream.{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_transport(config: &AppConfig) -> Result<(), ConfigError> {
    let transport = &config.transport;
    if transport.timeout == 0 {
        return Err(validation_err("transport.timeout must be greater than 0"));
    }
    if transport.connect_timeout == 0 {
        return Err(validation_err(
            "transport.connect_timeout must be greater than 0",
        ));
    }
    if transport.pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "transport.pool_max_idle_per_host must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_stream_settings(config: &AppConfig) -> Result<(), ConfigError> {
    let stream = &config.stream;
    let mut seen = HashSet::new();
    for field in &stream.reasoning_fields {
        if !KNOWN_REASONING_FIELDS
            .iter()
            .any(|(known, _)| *known == field.as_str())
        {
            let known: Vec<&str> = KNOWN_REASONING_FIELDS.iter().map(|(name, _)| *name).collect();
            return Err(validation_err(format!(
                "stream.reasoning_fields: unknown field '{field}'. Must be one of: {}",
                known.join(", ")
            )));
        }
        if !seen.insert(field.as_str()) {
            return Err(validation_err(format!(
                "stream.reasoning_fields: duplicate field '{field}'"
            )));
        }
    }
    for tag in &stream.reasoning_tags {
        let valid = !tag.is_empty()
            && tag
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !valid {
            return Err(validation_err(format!(
                "stream.reasoning_tags: invalid tag name '{tag}'"
            )));
        }
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
