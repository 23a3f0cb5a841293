use std::path::PathBuf;

use thiserror::Error;

use crate::hook::{HookKind, InheritanceDepth, MAX_INHERITANCE_DEPTH};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("inheritance depth {0} exceeds the maximum of {max}", max = MAX_INHERITANCE_DEPTH)]
    DepthOutOfRange(u8),

    #[error("slot indices start at 1")]
    SlotIndexZero,

    #[error("hook entry has an empty class name")]
    EmptyClassName,

    #[error("per-object hook for '{class_name}' must use depth 0, got {depth}")]
    PerObjectDepth {
        class_name: String,
        depth: InheritanceDepth,
    },

    #[error("duplicate {kind} hook for '{class_name}' at depth {depth}")]
    DuplicateHook {
        class_name: String,
        kind: HookKind,
        depth: InheritanceDepth,
    },

    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
