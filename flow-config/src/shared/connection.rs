use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::shared::ValidationError;

/// Application name reported by catalog connections.
const APP_NAME_CATALOG: &str = "peerdb_flow_catalog";

/// Connection settings for a Postgres database.
///
/// Used for the catalog; the password is wrapped in [`SecretString`] so it
/// is never printed through `Debug` or logs.
#[derive(Debug, Clone, Deserialize)]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Database name.
    pub name: String,
    pub username: String,
    pub password: Option<SecretString>,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl PgConnectionConfig {
    /// Checks the settings that would otherwise only fail at connect time.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "host".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "port".to_string(),
                constraint: "must be a valid TCP port".to_string(),
            });
        }

        Ok(())
    }

    /// Converts this configuration into `sqlx` connect options targeting the
    /// configured database.
    pub fn with_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            PgSslMode::VerifyFull
        } else {
            PgSslMode::Prefer
        };

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.username)
            .ssl_mode(ssl_mode)
            .application_name(APP_NAME_CATALOG);

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }
}

/// TLS settings for Postgres connections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    /// When enabled, server certificates are fully verified.
    #[serde(default)]
    pub enabled: bool,
    /// PEM-encoded trusted root certificates.
    #[serde(default)]
    pub trusted_root_certs: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(tls_enabled: bool) -> PgConnectionConfig {
        PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "catalog".to_string(),
            username: "peerdb".to_string(),
            password: Some(SecretString::from("secret".to_string())),
            tls: TlsConfig {
                enabled: tls_enabled,
                trusted_root_certs: String::new(),
            },
        }
    }

    #[test]
    fn debug_does_not_leak_password() {
        let rendered = format!("{:?}", test_config(false));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn connect_options_carry_database() {
        let options = test_config(true).with_db();
        assert_eq!(options.get_database(), Some("catalog"));
        assert_eq!(options.get_host(), "localhost");
    }

    #[test]
    fn validation_rejects_empty_host() {
        let mut config = test_config(false);
        config.host.clear();
        assert!(config.validate().is_err());
        assert!(test_config(false).validate().is_ok());
    }
}
