//! Engine configuration loaded from YAML.
//!
//! ```yaml
//! table_capacity: 100
//! registry_capacity: 20
//! hooks:
//!   - class_name: IOUserClient
//!     kind: shared_vtable
//!     depth: 1
//!   - class_name: Widget
//!     kind: per_object
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::hook::{ClassHookSpec, HookKind, InheritanceDepth};

pub const DEFAULT_TABLE_CAPACITY: usize = 100;
pub const DEFAULT_REGISTRY_CAPACITY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Initial capacity of the hook state table.
    pub table_capacity: usize,
    /// Initial capacity of each registry dictionary.
    pub registry_capacity: usize,
    /// Classes registered when the engine starts.
    pub hooks: Vec<ClassHookSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_capacity: DEFAULT_TABLE_CAPACITY,
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
            hooks: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("table_capacity"));
        }
        if self.registry_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("registry_capacity"));
        }

        let mut seen = HashSet::with_capacity(self.hooks.len());
        for spec in &self.hooks {
            if spec.class_name.trim().is_empty() {
                return Err(ConfigError::EmptyClassName);
            }
            if spec.kind == HookKind::PerObject && spec.depth != InheritanceDepth::LEAF {
                return Err(ConfigError::PerObjectDepth {
                    class_name: spec.class_name.clone(),
                    depth: spec.depth,
                });
            }
            if !seen.insert((spec.class_name.as_str(), spec.kind, spec.depth)) {
                return Err(ConfigError::DuplicateHook {
                    class_name: spec.class_name.clone(),
                    kind: spec.kind,
                    depth: spec.depth,
                });
            }
        }
        Ok(())
    }
}
