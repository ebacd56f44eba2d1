//! Launch request options.
//!
//! `LaunchOptions` is assembled by the CLI (or any other front end) and is
//! read-only to the launcher core. Everything here describes *what* the
//! caller asked for; the launcher decides how to realize it.

use std::path::PathBuf;

/// Network isolation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Share the host network (no network namespace).
    #[default]
    Host,
    /// Isolated network namespace with no interfaces.
    None,
}

/// Home directory specification, `src[:dest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HomeSpec {
    /// Host directory to mount.
    pub source: PathBuf,
    /// Destination inside the container (defaults to the source path).
    pub dest: PathBuf,
    /// Whether the user passed `--home` explicitly.
    pub custom: bool,
}

impl HomeSpec {
    /// Parse a `src[:dest]` home specification.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        match spec.split_once(':') {
            Some((src, dest)) => Self {
                source: PathBuf::from(src),
                dest: PathBuf::from(dest),
                custom: true,
            },
            None => Self {
                source: PathBuf::from(spec),
                dest: PathBuf::from(spec),
                custom: true,
            },
        }
    }
}

/// Per-phase mount policy flags.
///
/// Each flag disables one phase of the mount pipeline. A disabled phase is
/// logged and skipped, never an error.
#[derive(Debug, Clone)]
pub struct MountPolicy {
    /// Mount /proc.
    pub proc: bool,
    /// Mount /sys.
    pub sys: bool,
    /// Mount a minimal /dev (tmpfs + devpts + shm + mqueue).
    pub dev: bool,
    /// Mount fresh tmpfs on /tmp and /var/tmp.
    pub tmp: bool,
    /// Mount the home directory.
    pub home: bool,
    /// GPU device and library binds.
    pub gpu: bool,
}

impl Default for MountPolicy {
    fn default() -> Self {
        Self {
            proc: true,
            sys: true,
            dev: true,
            tmp: true,
            home: true,
            gpu: true,
        }
    }
}

/// Immutable description of a launch request.
///
/// Owned by the CLI collaborator; the launcher only reads it.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Explicit process to run instead of the image entrypoint.
    pub process: Option<String>,
    /// Arguments for the container process.
    pub args: Vec<String>,

    /// Create a PID namespace (on unless suppressed).
    pub no_pid_ns: bool,
    /// Requested network mode.
    pub network: NetworkMode,
    /// Hostname (implies a UTS namespace).
    pub hostname: Option<String>,

    /// Home directory override, `src[:dest]`.
    pub home: Option<HomeSpec>,
    /// Bind specifications (`src[:dest[:opts]]`).
    pub binds: Vec<String>,
    /// Docker-style `--mount` specifications (`key=value,...`).
    pub mounts: Vec<String>,
    /// Data-container images mounted whole (`image[:dest]`).
    pub data: Vec<String>,
    /// Overlay specifications (`path[:ro]`).
    pub overlays: Vec<String>,
    /// Scratch directories created as tmpfs inside the container.
    pub scratch: Vec<PathBuf>,
    /// Make the root filesystem writable through an ephemeral tmpfs layer.
    pub writable_tmpfs: bool,

    /// Run as root inside the container while unprivileged outside.
    pub fakeroot: bool,
    /// Drop all capabilities.
    pub no_privs: bool,
    /// Keep the caller's effective capability set.
    pub keep_privs: bool,
    /// Capabilities to add on top of the baseline.
    pub add_caps: Vec<String>,
    /// Capabilities to drop from the baseline.
    pub drop_caps: Vec<String>,
    /// Allow setuid binaries in binds and overlays.
    pub allow_suid: bool,

    /// Environment overrides (`KEY=VALUE`), highest precedence.
    pub env: Vec<String>,
    /// File of `KEY=VALUE` lines, evaluated below `--env`.
    pub env_files: Vec<PathBuf>,
    /// DNS servers for the synthesized resolv.conf.
    pub dns: Option<String>,

    /// CDI device selectors (`vendor.domain/class=name`).
    pub devices: Vec<String>,
    /// Directories searched for CDI spec files.
    pub cdi_dirs: Vec<PathBuf>,

    /// Cgroup resource limits as OCI resources JSON.
    pub cgroup_json: Option<String>,

    /// Working directory for the container process.
    pub cwd: Option<PathBuf>,
    /// Umask for the container process (e.g. 0o022).
    pub umask: Option<u32>,
    /// Do not set supplementary groups in the container.
    pub no_setgroups: bool,
    /// Native-emulation mode: system binds and cwd binds from host config.
    pub no_compat: bool,
    /// Bind NVIDIA devices and libraries.
    pub nvidia: bool,
    /// Bind ROCm devices and libraries.
    pub rocm: bool,
    /// Additional host libraries bound into the container library dir.
    pub libraries: Vec<PathBuf>,

    /// Per-phase mount policy.
    pub mount_policy: MountPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_spec_with_dest() {
        let spec = HomeSpec::parse("/data/alice:/home/alice");
        assert_eq!(spec.source, PathBuf::from("/data/alice"));
        assert_eq!(spec.dest, PathBuf::from("/home/alice"));
    }

    #[test]
    fn home_spec_source_only() {
        let spec = HomeSpec::parse("/home/alice");
        assert_eq!(spec.source, spec.dest);
    }

    #[test]
    fn default_policy_enables_all_phases() {
        let policy = MountPolicy::default();
        assert!(policy.proc && policy.sys && policy.dev && policy.tmp && policy.home);
    }
}
