//! Declaration parser for loading declaration files.
//!
//! This module handles loading declarations from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::DeclarationFile;

/// Default declaration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Parser for loading declaration files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new declaration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a declaration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeclarationFile> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading declaration");

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a declaration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeclarationFile> {
        debug!("parsing YAML declaration");

        let declaration: DeclarationFile = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            project = %declaration.project.name,
            resources = declaration.resources.len(),
            kinds = declaration.kinds.len(),
            "parsed declaration"
        );
        Ok(declaration)
    }

    /// Loads a declaration with environment variable overrides.
    ///
    /// Recognised variables: `CONVERGE_PROJECT_NAME`, `CONVERGE_ENVIRONMENT`,
    /// `CONVERGE_STATE_PATH` and `CONVERGE_PARALLELISM`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeclarationFile> {
        let mut declaration = self.load_file(path)?;
        Self::apply_env_overrides(&mut declaration, |name| std::env::var(name).ok());
        Ok(declaration)
    }

    /// Applies overrides looked up through `var`.
    pub fn apply_env_overrides<F>(declaration: &mut DeclarationFile, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = var("CONVERGE_PROJECT_NAME") {
            debug!("overriding project.name from environment");
            declaration.project.name = name;
        }

        if let Some(env) = var("CONVERGE_ENVIRONMENT") {
            debug!("overriding project.environment from environment");
            declaration.project.environment = env;
        }

        if let Some(path) = var("CONVERGE_STATE_PATH") {
            debug!("overriding state.path from environment");
            declaration.state.path = Some(path);
        }

        if let Some(raw) = var("CONVERGE_PARALLELISM") {
            match raw.parse::<usize>() {
                Ok(n) => declaration.settings.parallelism = n,
                Err(e) => warn!(value = %raw, error = %e, "ignoring invalid CONVERGE_PARALLELISM"),
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!(path = %env_path.display(), "loading environment");
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(path = %env_path.display(), ".env file not found");
        }

        Ok(())
    }
}

/// Finds the declaration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no declaration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!(path = %config_path.display(), "found declaration file");
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
