//! Raw configuration sources: the TOML file and `DK_*` environment variables.
//!
//! Sources produce a JSON object per block; the registry deserializes that
//! object into the block's struct. Environment values win over file values.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::types::ConfigError;

pub const DEFAULT_CONFIG_FILE_PATHS: &[&str] = &["agent.toml", "/etc/observability/agent.toml"];

/// Reads the first configuration file that exists and keeps its parsed table.
#[derive(Debug, Default)]
pub struct FileSource {
    table: toml::Table,
}

impl FileSource {
    /// Load from the first existing path; an empty table when none exists.
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        for path in paths {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|e| ConfigError::FileParse {
                    path: path.display().to_string(),
                    detail: e.to_string(),
                })?;
                let table: toml::Table =
                    text.parse().map_err(|e: toml::de::Error| ConfigError::FileParse {
                        path: path.display().to_string(),
                        detail: e.to_string(),
                    })?;
                tracing::info!(path = %path.display(), "loaded configuration file");
                return Ok(Self { table });
            }
        }
        Ok(Self::default())
    }

    /// The named section as a JSON object; empty when the section is absent.
    pub fn section(&self, name: &str) -> Map<String, Value> {
        match self.table.get(name) {
            Some(toml::Value::Table(section)) => section
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_json(v.clone())))
                .collect(),
            _ => Map::new(),
        }
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => Value::from(f),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Overlay environment variables `<prefix><field>` onto `target`.
///
/// Variable names are matched case-insensitively. Values are coerced by JSON
/// parsing so numbers, booleans and arrays round-trip; anything that is not
/// valid JSON stays a plain string. Only recognized fields are picked up: the
/// `DK_` prefix is shared by several blocks, so unknown names must not leak
/// between blocks.
pub fn overlay_env(target: &mut Map<String, Value>, prefix: &str, fields: &[&str]) {
    let prefix_lower = prefix.to_ascii_lowercase();
    for (name, raw) in std::env::vars() {
        let name_lower = name.to_ascii_lowercase();
        let Some(field) = name_lower.strip_prefix(&prefix_lower) else {
            continue;
        };
        if !fields.contains(&field) {
            continue;
        }
        target.insert(field.to_string(), coerce_env_value(&raw));
    }
}

fn coerce_env_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(parsed) => parsed,
        Err(_) => Value::String(raw.to_string()),
    }
}

pub fn default_paths() -> Vec<PathBuf> {
    DEFAULT_CONFIG_FILE_PATHS.iter().map(PathBuf::from).collect()
}

pub fn paths_from<P: AsRef<Path>>(paths: &[P]) -> Vec<PathBuf> {
    paths.iter().map(|p| p.as_ref().to_path_buf()).collect()
}
