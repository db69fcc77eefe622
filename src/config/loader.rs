//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::group::GroupsFile;
use crate::config::schema::NodeConfig;
use crate::config::validation::{validate_config, validate_group, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate the node configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: NodeConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Load a groups file. Every group must validate, and names must be unique.
pub fn load_groups_file(path: &Path) -> Result<GroupsFile, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_groups(&content)
}

/// Parse and validate groups from TOML text.
pub fn parse_groups(content: &str) -> Result<GroupsFile, ConfigError> {
    let file: GroupsFile = toml::from_str(content)?;

    let mut errors = Vec::new();
    let mut names = std::collections::HashSet::new();
    for def in &file.groups {
        if !names.insert(def.group.name.as_str()) {
            errors.push(ValidationError {
                field: "groups".to_string(),
                message: format!("duplicate group {:?}", def.group.name),
            });
        }
        if let Err(group_errors) = validate_group(&def.group) {
            errors.extend(group_errors.into_iter().map(|e| ValidationError {
                field: format!("{}.{}", def.group.name, e.field),
                message: e.message,
            }));
        }
        for id in &def.draining {
            if def.group.backend(id).is_none() {
                errors.push(ValidationError {
                    field: format!("{}.draining", def.group.name),
                    message: format!("unknown backend {:?}", id),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(file)
    } else {
        Err(ConfigError::Validation(errors))
    }
}
