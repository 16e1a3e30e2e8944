//! Configuration validation rules.

use super::schema::Config;

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();

    if config.bus.mailbox_capacity == 0 {
        errors.push("bus.mailbox_capacity must be > 0".to_string());
    }
    if config.bus.history_capacity == 0 {
        errors.push("bus.history_capacity must be > 0".to_string());
    }

    if config.coordinator.agent_id.trim().is_empty() {
        errors.push("coordinator.agent_id must not be empty".to_string());
    }
    if config.coordinator.default_timeout_ms == 0 {
        errors.push("coordinator.default_timeout_ms must be > 0".to_string());
    }
    if config.coordinator.status_timeout_ms == 0 {
        errors.push("coordinator.status_timeout_ms must be > 0".to_string());
    }
    if config
        .coordinator
        .capabilities
        .iter()
        .any(|c| c.trim().is_empty())
    {
        errors.push("coordinator.capabilities must not contain empty tags".to_string());
    }

    let format = config.logging.format.to_ascii_lowercase();
    if format != "text" && format != "json" {
        errors.push(format!(
            "logging.format must be 'text' or 'json', got '{}'",
            config.logging.format
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Validation(errors.join("; ")))
    }
}
