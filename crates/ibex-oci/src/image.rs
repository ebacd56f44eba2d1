//! OCI Image Specification types.
//!
//! Only the execution-relevant slice of the image config is modelled: the
//! launcher needs `User`, `Env`, `Entrypoint`, `Cmd` and `WorkingDir` to
//! finalize the container process, nothing else.
//!
//! Based on the OCI Image Specification v1.1.0:
//! <https://github.com/opencontainers/image-spec>

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use ibex_common::IbexResult;

/// OCI Image Configuration, as stored in the bundle after extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Architecture the image was built for.
    #[serde(default)]
    pub architecture: String,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Execution parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ImageExecution>,
}

impl ImageConfig {
    /// Load an image config JSON file.
    pub fn from_file(path: &Path) -> IbexResult<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data).map_err(ibex_common::IbexError::from)?)
    }

    /// Execution config, or an empty default when the image has none.
    #[must_use]
    pub fn execution(&self) -> ImageExecution {
        self.config.clone().unwrap_or_default()
    }
}

/// Execution configuration of an image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageExecution {
    /// User the image declares (`name`, `uid`, `name:group` or `uid:gid`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Environment variables (`KEY=VALUE`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Entrypoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Stop signal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

impl ImageExecution {
    /// Whether the image declares its own user.
    #[must_use]
    pub fn declares_user(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.is_empty())
    }
}
