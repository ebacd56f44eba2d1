//! Container state as reported by the external runtime.
//!
//! The launcher never drives this machine itself — `state` output from
//! `crun`/`runc` is parsed into these types and the predicates are used to
//! decide which lifecycle operations make sense.
//!
//! Based on the OCI Runtime Specification state format:
//! <https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state>

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Container runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// OCI version.
    pub oci_version: String,
    /// Container ID.
    pub id: String,
    /// Container status.
    pub status: ContainerStatus,
    /// Process ID of the container init process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Path to the OCI bundle.
    pub bundle: PathBuf,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Container status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is being created.
    Creating,
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has exited.
    Stopped,
    /// Container is paused.
    Paused,
}

impl ContainerStatus {
    /// Returns true if the container can be started.
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Returns true if the container can be killed.
    #[must_use]
    pub const fn can_kill(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Returns true if the container can be deleted.
    #[must_use]
    pub const fn can_delete(&self) -> bool {
        matches!(self, Self::Stopped | Self::Created)
    }

    /// Returns true if the container can be paused.
    #[must_use]
    pub const fn can_pause(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the container can be resumed.
    #[must_use]
    pub const fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
        }
    }
}
