//! Standard filesystem paths for the launcher.
//!
//! Two path families live here: the per-container *state directory* under
//! the user's home, and the *runtime state root* handed to the external OCI
//! runtime via `--root`. Both keep the on-disk layout that Singularity's
//! OCI mode established, so existing tooling can find logs and pid files.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::error::{IbexError, IbexResult};

/// Name of the advisory lock file inside a bundle directory.
pub const BUNDLE_LOCK_FILE: &str = ".singularity-oci.lock";

/// Runtime state root used when running as root.
const ROOT_STATE_ROOT: &str = "/run/singularity-oci";

/// Base directory for per-container state, relative to `$HOME`.
static STATE_BASE: Lazy<PathBuf> = Lazy::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".singularity")
        .join("oci")
});

/// Per-container state directory layout.
///
/// `~/.singularity/oci/<hostname>/<containerID>/` holds the pid files, log
/// files, the `bundle` symlink back to the bundle directory and the attach
/// socket exposed by the logging helper.
#[derive(Debug, Clone)]
pub struct StatePaths {
    dir: PathBuf,
}

impl StatePaths {
    /// State directory for a container ID on this host.
    #[must_use]
    pub fn for_container(id: &str) -> Self {
        let hostname = hostname();
        Self {
            dir: STATE_BASE.join(hostname).join(id),
        }
    }

    /// State directory rooted at an explicit base (used by tests).
    #[must_use]
    pub fn with_base(base: impl Into<PathBuf>, hostname: &str, id: &str) -> Self {
        Self {
            dir: base.into().join(hostname).join(id),
        }
    }

    /// The state directory itself.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pid file of the logging helper.
    #[must_use]
    pub fn conmon_pid(&self) -> PathBuf {
        self.dir.join("conmon.pid")
    }

    /// Pid file of the container init process.
    #[must_use]
    pub fn container_pid(&self) -> PathBuf {
        self.dir.join("container.pid")
    }

    /// Container stdout/stderr log.
    #[must_use]
    pub fn container_log(&self) -> PathBuf {
        self.dir.join("container.log")
    }

    /// JSON error log written by the external runtime.
    #[must_use]
    pub fn runtime_log(&self) -> PathBuf {
        self.dir.join("runc.log")
    }

    /// Symlink back to the bundle directory.
    #[must_use]
    pub fn bundle_link(&self) -> PathBuf {
        self.dir.join("bundle")
    }

    /// Unix socket for attaching to the container's stdio.
    #[must_use]
    pub fn attach_socket(&self) -> PathBuf {
        self.dir.join("attach")
    }

    /// Create the state directory.
    pub fn create(&self) -> IbexResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Remove the state directory and everything in it.
    pub fn remove(&self) -> IbexResult<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Resolve the `--root` state directory for the external OCI runtime.
///
/// Root uses a fixed location under `/run`. Unprivileged users prefer
/// `$XDG_RUNTIME_DIR`, then `/run/user/<uid>`, and finally fall back to a
/// per-uid directory under `$TMPDIR` which is created on demand and
/// validated for correct ownership and `0700` permissions.
pub fn runtime_state_root(uid: u32) -> IbexResult<PathBuf> {
    if uid == 0 {
        return Ok(PathBuf::from(ROOT_STATE_ROOT));
    }

    if let Some(xdg) = std::env::var_os("XDG_RUNTIME_DIR") {
        let xdg = PathBuf::from(xdg);
        if xdg.is_dir() {
            return Ok(xdg.join("singularity-oci"));
        }
        tracing::debug!(dir = %xdg.display(), "XDG_RUNTIME_DIR is not usable");
    }

    let run_user = PathBuf::from(format!("/run/user/{uid}"));
    if run_user.is_dir() {
        return Ok(run_user.join("singularity-oci"));
    }

    let tmp = std::env::var_os("TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let fallback = tmp.join(format!("singularity-oci-{uid}"));
    ensure_private_dir(&fallback, uid)?;
    Ok(fallback)
}

/// Create `dir` if needed and verify it is owned by `uid` with mode `0700`.
fn ensure_private_dir(dir: &Path, uid: u32) -> IbexResult<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let meta = std::fs::metadata(dir)?;
    if meta.uid() != uid {
        return Err(IbexError::config(format!(
            "state directory {} is owned by uid {}, not {}",
            dir.display(),
            meta.uid(),
            uid
        )));
    }
    if meta.permissions().mode() & 0o777 != 0o700 {
        return Err(IbexError::config(format!(
            "state directory {} must have mode 0700",
            dir.display()
        )));
    }
    Ok(())
}

/// Best-effort hostname, falling back to "localhost".
#[must_use]
pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
