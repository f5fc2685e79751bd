//! Stack file loading.
//!
//! This module loads the stack file from YAML, applies environment overrides
//! and turns resource entries into [`ResourceSpec`]s with parsed templates.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::graph::{ResourceSpec, Value};

use super::spec::StackConfig;

/// Prefix of environment variables that set stack variables.
pub const VARIABLE_ENV_PREFIX: &str = "TERRACE_VAR_";

/// Default stack file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["terrace.yaml", "terrace.yml", "stack.yaml"];

/// Loader for stack files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for locating `.env`.
    base_path: Option<PathBuf>,
}

/// Resources and exports of a stack, ready to declare on an engine.
#[derive(Debug, Clone, Default)]
pub struct StackDeclarations {
    /// Resource specs in declaration order.
    pub resources: Vec<ResourceSpec>,
    /// Exported outputs in name order.
    pub exports: Vec<(String, Value)>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory searched for `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: format!("YAML parse error: {e}"),
            location: source.map(|p| p.display().to_string()),
        })?;

        debug!(
            "Parsed stack {} with {} resources",
            config.stack.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack file and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// is not a valid number.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config, std::env::vars())?;
        Ok(config)
    }

    /// Applies `TERRACE_*` overrides from `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override does not parse.
    pub fn apply_env_overrides(
        config: &mut StackConfig,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "TERRACE_PARALLELISM" => {
                    debug!("Overriding settings.parallelism from environment");
                    config.settings.parallelism = parse_number(&key, &value)?;
                }
                "TERRACE_CALL_TIMEOUT_SECS" => {
                    debug!("Overriding settings.call_timeout_secs from environment");
                    config.settings.call_timeout_secs = parse_number(&key, &value)?;
                }
                "TERRACE_STATE_BUCKET" => {
                    debug!("Overriding state.bucket from environment");
                    config.state.bucket = Some(value);
                }
                "TERRACE_STATE_PREFIX" => {
                    debug!("Overriding state.prefix from environment");
                    config.state.prefix = Some(value);
                }
                _ => {
                    if let Some(name) = key.strip_prefix(VARIABLE_ENV_PREFIX)
                        && !name.is_empty()
                    {
                        debug!("Setting variable {name} from environment");
                        config.variables.insert(name.to_string(), value);
                    }
                }
            }
        }
        Ok(())
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Converts the stack's resources and outputs into declarations.
    ///
    /// Templates are parsed and `${var.name}` references are replaced by the
    /// stack variables.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed templates and undefined variables.
    pub fn declarations(config: &StackConfig) -> Result<StackDeclarations> {
        let mut resources = Vec::with_capacity(config.resources.len());

        for resource in &config.resources {
            let mut spec = ResourceSpec::new(&resource.kind, &resource.name);
            for (key, raw) in &resource.inputs {
                let value = Value::from_json(raw.clone())?.bind_variables(&config.variables)?;
                spec = spec.input(key.clone(), value);
            }
            for dep in &resource.depends_on {
                spec = spec.depends_on(dep.clone());
            }
            resources.push(spec);
        }

        let exports = config
            .outputs
            .iter()
            .map(|(name, template)| {
                let value = Value::parse_template(template)?.bind_variables(&config.variables)?;
                Ok((name.clone(), value))
            })
            .collect::<std::result::Result<Vec<_>, ConfigError>>()?;

        Ok(StackDeclarations { resources, exports })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::validation(format!("{key} must be a positive integer, got '{value}'"), key).into()
    })
}

/// Finds the stack file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}
