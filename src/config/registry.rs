//! The configuration registry: owns every loaded block for the process
//! lifetime.
//!
//! Blocks are immutable once constructed. "Mutation" produces a new block
//! from the stored one with named fields overridden; the stored block is
//! untouched.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use serde::de::DeserializeOwned;

use super::sources::{self, FileSource};
use super::types::ConfigError;

/// A named, validated configuration block.
pub trait ConfigBlock: DeserializeOwned + Clone + Send + Sync + 'static {
    /// Section name in the configuration file; also the registry key.
    const NAME: &'static str;
    /// Environment variable prefix, e.g. `DK_HTTP_`.
    const ENV_PREFIX: &'static str;
    /// Recognized field names; only these are picked up from the environment.
    const FIELDS: &'static [&'static str];

    /// Cross-field validation and normalization, run once at construction.
    fn validate(&mut self) -> Result<(), ConfigError> {
        Ok(())
    }
}

pub struct ConfigRegistry {
    blocks: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
    file_paths: Vec<PathBuf>,
    file: OnceLock<FileSource>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::with_paths(sources::default_paths())
    }

    /// Registry reading from explicit file paths; used by tests.
    pub fn with_paths(file_paths: Vec<PathBuf>) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            file_paths,
            file: OnceLock::new(),
        }
    }

    fn file(&self) -> Result<&FileSource, ConfigError> {
        if let Some(file) = self.file.get() {
            return Ok(file);
        }
        let loaded = FileSource::load(&self.file_paths)?;
        Ok(self.file.get_or_init(|| loaded))
    }

    fn build<C: ConfigBlock>(&self) -> Result<C, ConfigError> {
        let mut raw = self.file()?.section(C::NAME);
        sources::overlay_env(&mut raw, C::ENV_PREFIX, C::FIELDS);
        let mut block: C = serde_json::from_value(serde_json::Value::Object(raw))
            .map_err(|e| ConfigError::invalid(C::NAME, e.to_string()))?;
        block.validate()?;
        Ok(block)
    }

    /// Load and store a block. Fails if the name is already present.
    pub fn register<C: ConfigBlock>(&self) -> Result<Arc<C>, ConfigError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        if blocks.contains_key(C::NAME) {
            return Err(ConfigError::AlreadyRegistered(C::NAME));
        }
        let block = Arc::new(self.build::<C>()?);
        blocks.insert(C::NAME, block.clone());
        Ok(block)
    }

    /// A previously registered block.
    pub fn lookup<C: ConfigBlock>(&self) -> Result<Arc<C>, ConfigError> {
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        blocks
            .get(C::NAME)
            .and_then(|any| any.clone().downcast::<C>().ok())
            .ok_or(ConfigError::NotRegistered(C::NAME))
    }

    /// Whether the block is available, registering it lazily on first ask.
    ///
    /// Returns `false` without side effects when the sources cannot satisfy
    /// the schema.
    pub fn available<C: ConfigBlock>(&self) -> bool {
        {
            let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
            if blocks.contains_key(C::NAME) {
                return true;
            }
        }
        match self.build::<C>() {
            Ok(block) => {
                let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
                blocks.entry(C::NAME).or_insert_with(|| Arc::new(block));
                true
            }
            Err(err) => {
                tracing::debug!(block = C::NAME, %err, "configuration block not available");
                false
            }
        }
    }

    /// Force-store a block, replacing any existing one with the same name.
    pub fn add<C: ConfigBlock>(&self, block: C) -> Arc<C> {
        let block = Arc::new(block);
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        blocks.insert(C::NAME, block.clone());
        block
    }

    /// A copy of the stored block with `overrides` applied. The stored block
    /// is left untouched and the copy is re-validated.
    pub fn mutate<C: ConfigBlock>(
        &self,
        overrides: impl FnOnce(&mut C),
    ) -> Result<C, ConfigError> {
        let mut copy = (*self.lookup::<C>()?).clone();
        overrides(&mut copy);
        copy.validate()?;
        Ok(copy)
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}
