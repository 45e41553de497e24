//! Plan file loading. Plans are YAML documents with snake_case keys; the
//! engine itself is format-agnostic and only this module touches the wire
//! format.

use std::path::{Path, PathBuf};

use crate::types::Plan;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PlanFileError {
    #[error("failed to read plan file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse plan file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type Result<T> = std::result::Result<T, PlanFileError>;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a plan from a YAML file.
pub fn load_plan(path: impl AsRef<Path>) -> Result<Plan> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| PlanFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_plan(&text, path)
}

/// Parse a plan from YAML text. `path` is used only for error reporting.
pub fn parse_plan(text: &str, path: impl AsRef<Path>) -> Result<Plan> {
    serde_yaml::from_str(text).map_err(|source| PlanFileError::Parse {
        path: path.as_ref().to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
