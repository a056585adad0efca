use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Backend URL is http(s) and the tenant is set
/// - Terminal timeouts and event capacity are non-zero
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    let url = config.backend.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::ValidationError(format!(
            "backend.url must be an http(s) URL, got '{}'",
            url
        )));
    }

    if config.backend.tenant_id.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "backend.tenant_id cannot be empty".to_string(),
        ));
    }

    if config.backend.timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "backend.timeout_secs cannot be 0".to_string(),
        ));
    }

    let terminal = &config.terminal;
    for (name, value) in [
        ("terminal.discovery_timeout_ms", terminal.discovery_timeout_ms),
        ("terminal.connect_timeout_ms", terminal.connect_timeout_ms),
        ("terminal.cancel_wait_ms", terminal.cancel_wait_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::ValidationError(format!(
                "{} cannot be 0",
                name
            )));
        }
    }

    if terminal.event_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "terminal.event_capacity cannot be 0".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ServerConfig, TerminalConfig};
    use std::net::IpAddr;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig::default(),
            backend: BackendConfig {
                url: "https://payments.example.com".to_string(),
                tenant_id: "acme".to_string(),
                api_key: None,
                timeout_secs: 15,
            },
            terminal: TerminalConfig::default(),
        }
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = valid_config();
        config.server = ServerConfig {
            host: "0.0.0.0".parse::<IpAddr>().unwrap(),
            port: 0,
        };
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_backend_url_scheme() {
        let mut config = valid_config();
        config.backend.url = "ftp://payments.example.com".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_empty_tenant() {
        let mut config = valid_config();
        config.backend.tenant_id = "  ".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_timeouts() {
        let mut config = valid_config();
        config.terminal.connect_timeout_ms = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("connect_timeout_ms"));

        let mut config = valid_config();
        config.terminal.event_capacity = 0;
        assert!(validate_config(&config).is_err());
    }
}
