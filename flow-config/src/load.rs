use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory containing configuration files relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Environment variable holding an absolute path to the configuration directory.
const CONFIG_DIR_ENV_VAR: &str = "APP_CONFIG_DIR";

/// Supported extensions for configuration files, tried in order.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "APP";

/// Separator for nested keys in environment variables (`APP_CATALOG__HOST`).
const ENV_SEPARATOR: &str = "__";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// Failed to determine the current working directory.
    #[error("failed to determine the current directory")]
    CurrentDir(#[source] io::Error),

    /// The configuration directory does not exist.
    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    /// A required configuration file is missing for every supported extension.
    #[error("could not locate `{stem}.(yaml|yml|json)` in `{directory}`")]
    ConfigurationFileMissing { stem: String, directory: PathBuf },

    /// Failed to determine the runtime environment (`APP_ENVIRONMENT`).
    #[error("failed to determine runtime environment")]
    Environment(#[source] io::Error),

    /// The layered sources could not be assembled.
    #[error("failed to assemble configuration sources")]
    Builder(#[source] config::ConfigError),

    /// The merged configuration failed to deserialize into the target type.
    #[error("failed to deserialize configuration")]
    Deserialization(#[source] config::ConfigError),
}

/// Loads hierarchical configuration from files and environment variables.
///
/// The configuration directory is `$APP_CONFIG_DIR` when set, otherwise
/// `<current_dir>/configuration`. `base.(yaml|yml|json)` is loaded first,
/// then `{environment}.(yaml|yml|json)`, then `APP_`-prefixed environment
/// variables with `__` separating nested keys.
pub fn load_config<T: DeserializeOwned>() -> Result<T, LoadConfigError> {
    let directory = configuration_directory()?;
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(directory));
    }

    let environment = Environment::load().map_err(LoadConfigError::Environment)?;
    let base_file = find_configuration_file(&directory, "base")?;
    let environment_file = find_configuration_file(&directory, &environment.to_string())?;

    let settings = config::Config::builder()
        .add_source(config::File::from(base_file))
        .add_source(config::File::from(environment_file))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR),
        )
        .build()
        .map_err(LoadConfigError::Builder)?;

    settings
        .try_deserialize()
        .map_err(LoadConfigError::Deserialization)
}

fn configuration_directory() -> Result<PathBuf, LoadConfigError> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV_VAR) {
        return Ok(PathBuf::from(dir));
    }
    let current = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    Ok(current.join(CONFIGURATION_DIR))
}

fn find_configuration_file(directory: &Path, stem: &str) -> Result<PathBuf, LoadConfigError> {
    for extension in CONFIG_FILE_EXTENSIONS {
        let path = directory.join(format!("{stem}.{extension}"));
        if path.is_file() {
            return Ok(path);
        }
    }

    Err(LoadConfigError::ConfigurationFileMissing {
        stem: stem.to_string(),
        directory: directory.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use tempfile::TempDir;

    /// Serializes tests that mutate process-wide environment variables.
    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct TestConfig {
        name: String,
        retries: u32,
    }

    #[test]
    fn loads_base_and_environment_layers() {
        let _guard = env_lock().lock().unwrap();

        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().join("conf");
        fs::create_dir(&config_dir).unwrap();
        fs::write(config_dir.join("base.json"), r#"{"name": "base", "retries": 1}"#).unwrap();
        fs::write(config_dir.join("prod.json"), r#"{"retries": 7}"#).unwrap();

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, config_dir.to_str().unwrap());
            std::env::set_var("APP_ENVIRONMENT", "prod");
        }

        let loaded: TestConfig = load_config().unwrap();
        assert_eq!(
            loaded,
            TestConfig {
                name: "base".to_string(),
                retries: 7,
            }
        );

        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV_VAR);
            std::env::remove_var("APP_ENVIRONMENT");
        }
    }

    #[test]
    fn missing_directory_is_reported() {
        let _guard = env_lock().lock().unwrap();

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, "/definitely/not/a/real/path");
        }

        let result = load_config::<TestConfig>();
        assert!(matches!(
            result,
            Err(LoadConfigError::MissingConfigurationDirectory(_))
        ));

        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV_VAR);
        }
    }

    #[test]
    fn all_supported_extensions_are_found() {
        let temp_dir = TempDir::new().unwrap();
        for extension in CONFIG_FILE_EXTENSIONS {
            let path = temp_dir.path().join(format!("base.{extension}"));
            fs::write(&path, "{}").unwrap();
            assert_eq!(find_configuration_file(temp_dir.path(), "base").unwrap(), path);
            fs::remove_file(&path).unwrap();
        }
    }
}
