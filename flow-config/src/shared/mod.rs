//! Shared configuration types for the flow services.

mod connection;

pub use connection::{PgConnectionConfig, TlsConfig};

use thiserror::Error;

/// Validation failure for a configuration value.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
