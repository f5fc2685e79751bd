//! Stack configuration.
//!
//! This module handles all configuration-related functionality:
//! - Parsing `terrace.yaml` and applying environment overrides
//! - Validation of the stack file
//! - Hashing resolved inputs for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::InputsHasher;
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, StackDeclarations, VARIABLE_ENV_PREFIX, find_config_file,
};
pub use spec::{
    DEFAULT_PARALLELISM, ProviderConfig, ProviderType, ResourceConfig, SettingsConfig,
    StackConfig, StackInfo, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
