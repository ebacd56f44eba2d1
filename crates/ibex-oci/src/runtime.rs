//! OCI Runtime Specification types.
//!
//! Based on the OCI Runtime Specification v1.2.0:
//! <https://github.com/opencontainers/runtime-spec/blob/main/config.md>

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ibex_common::IbexResult;

/// OCI Runtime Specification (config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    /// OCI version.
    #[serde(default = "default_oci_version")]
    pub oci_version: String,

    /// Container's root filesystem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,

    /// Container process configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,

    /// Container hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Ordered mount list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    /// Annotations (key-value pairs).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,

    /// Linux-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

fn default_oci_version() -> String {
    "1.2.0".to_string()
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            oci_version: default_oci_version(),
            root: None,
            process: None,
            hostname: None,
            mounts: Vec::new(),
            annotations: HashMap::new(),
            linux: None,
        }
    }
}

impl Spec {
    /// Linux section, created on first use.
    pub fn linux_mut(&mut self) -> &mut Linux {
        self.linux.get_or_insert_with(Linux::default)
    }

    /// Whether a namespace of the given type is already present.
    #[must_use]
    pub fn has_namespace(&self, ns_type: NamespaceType) -> bool {
        self.linux
            .as_ref()
            .is_some_and(|l| l.namespaces.iter().any(|n| n.ns_type == ns_type))
    }

    /// Add a namespace unless one of the same type already exists.
    pub fn add_namespace(&mut self, ns_type: NamespaceType) {
        if !self.has_namespace(ns_type) {
            self.linux_mut().namespaces.push(Namespace {
                ns_type,
                path: None,
            });
        }
    }

    /// Write the config.json into a bundle directory.
    pub fn save(&self, bundle: &Path) -> IbexResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(ibex_common::IbexError::from)?;
        std::fs::write(bundle.join("config.json"), json)?;
        Ok(())
    }

    /// Load a config.json from a bundle directory.
    pub fn load(bundle: &Path) -> IbexResult<Self> {
        let data = std::fs::read(bundle.join("config.json"))?;
        Ok(serde_json::from_slice(&data).map_err(ibex_common::IbexError::from)?)
    }
}

/// Root filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    /// Path to the root filesystem.
    pub path: PathBuf,

    /// Whether the root filesystem is read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// Process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    /// Whether to run with a terminal.
    #[serde(default)]
    pub terminal: bool,

    /// User to run as.
    #[serde(default)]
    pub user: User,

    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables (`KEY=VALUE`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Working directory.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// Capabilities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,

    /// No new privileges flag.
    #[serde(default)]
    pub no_new_privileges: bool,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

/// User, group and umask of the container process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
    /// Umask applied before exec.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub umask: Option<u32>,
    /// Additional group IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

impl Default for User {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            umask: None,
            additional_gids: Vec::new(),
        }
    }
}

/// Linux capability sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Bounding capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounding: Vec<String>,
    /// Effective capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effective: Vec<String>,
    /// Inheritable capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inheritable: Vec<String>,
    /// Permitted capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permitted: Vec<String>,
    /// Ambient capabilities.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambient: Vec<String>,
}

/// Mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount destination path (inside container).
    pub destination: PathBuf,
    /// Mount type (e.g., "bind", "tmpfs", "proc").
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    /// Mount source path (outside container).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    /// Mount options.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Mount {
    /// A bind mount with the given options.
    #[must_use]
    pub fn bind(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: &[&str],
    ) -> Self {
        Self {
            destination: destination.into(),
            mount_type: None,
            source: Some(source.into()),
            options: options.iter().map(ToString::to_string).collect(),
        }
    }

    /// A virtual filesystem mount (proc, sysfs, tmpfs, devpts, mqueue).
    #[must_use]
    pub fn filesystem(
        fs_type: &str,
        source: &str,
        destination: impl Into<PathBuf>,
        options: &[&str],
    ) -> Self {
        Self {
            destination: destination.into(),
            mount_type: Some(fs_type.to_string()),
            source: Some(PathBuf::from(source)),
            options: options.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Linux-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    /// UID mappings (for user namespaces).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings (for user namespaces).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    /// Namespaces to create/join.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
    /// Devices to create.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<LinuxDevice>,
    /// Cgroup path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    /// Resource limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

/// ID mapping for user/group namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    /// Container ID (start of range).
    pub container_id: u32,
    /// Host ID (start of range).
    pub host_id: u32,
    /// Size of the range.
    pub size: u32,
}

/// Namespace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace type.
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path to existing namespace (to join instead of create).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Namespace types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    /// PID namespace.
    Pid,
    /// Network namespace.
    Network,
    /// Mount namespace.
    Mount,
    /// IPC namespace.
    Ipc,
    /// UTS namespace.
    Uts,
    /// User namespace.
    User,
    /// Cgroup namespace.
    Cgroup,
}

/// Device node to create inside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxDevice {
    /// Device path.
    pub path: PathBuf,
    /// Device type (c for char, b for block).
    #[serde(rename = "type")]
    pub device_type: String,
    /// Major number.
    pub major: i64,
    /// Minor number.
    pub minor: i64,
    /// File mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
    /// UID of the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// GID of the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
}

/// Device cgroup allow/deny rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxDeviceCgroup {
    /// Whether the rule allows access.
    pub allow: bool,
    /// Device type (a, c or b).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Major number (None matches all).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub major: Option<i64>,
    /// Minor number (None matches all).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor: Option<i64>,
    /// Access string (some of r, w, m).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
}

/// Resource limits.
///
/// Deserialized from the user-supplied cgroup resource JSON; the field set
/// mirrors what `crun`/`runc` accept rather than everything the OCI spec
/// names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
    /// Memory resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
    /// PIDs limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<PidsResources>,
    /// Device cgroup rules.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<LinuxDeviceCgroup>,
}

/// CPU resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuResources {
    /// CPU shares (relative weight).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    /// CPU quota (in microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    /// CPU period (in microseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    /// CPUs to use (e.g., "0-2,4").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    /// Memory nodes to use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mems: Option<String>,
}

/// Memory resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryResources {
    /// Hard memory limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    /// Memory reservation (soft limit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<i64>,
    /// Memory + swap limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
    /// Disable OOM killer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_oom_killer: Option<bool>,
}

/// PIDs resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidsResources {
    /// Maximum number of PIDs.
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_default() {
        let spec = Spec::default();
        assert_eq!(spec.oci_version, "1.2.0");
        assert!(spec.root.is_none());
        assert!(spec.process.is_none());
    }

    #[test]
    fn namespace_dedup() {
        let mut spec = Spec::default();
        spec.add_namespace(NamespaceType::Ipc);
        spec.add_namespace(NamespaceType::Ipc);
        assert_eq!(spec.linux.unwrap().namespaces.len(), 1);
    }

    #[test]
    fn namespace_type_serialization() {
        let ns = Namespace {
            ns_type: NamespaceType::Pid,
            path: None,
        };
        let json = serde_json::to_string(&ns).unwrap();
        assert!(json.contains("\"type\":\"pid\""));
    }

    #[test]
    fn mount_constructors() {
        let m = Mount::bind("/tmp", "/mnt", &["rbind", "ro"]);
        assert_eq!(m.source.as_deref(), Some(Path::new("/tmp")));
        assert!(m.mount_type.is_none());

        let m = Mount::filesystem("proc", "proc", "/proc", &["nosuid", "noexec", "nodev"]);
        assert_eq!(m.mount_type.as_deref(), Some("proc"));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = Spec {
            root: Some(Root {
                path: "rootfs".into(),
                readonly: true,
            }),
            hostname: Some("compute-node".to_string()),
            ..Default::default()
        };
        spec.save(tmp.path()).unwrap();
        let loaded = Spec::load(tmp.path()).unwrap();
        assert_eq!(loaded.hostname.as_deref(), Some("compute-node"));
        assert!(loaded.root.unwrap().readonly);
    }

    #[test]
    fn resources_from_user_json() {
        let json = r#"{"memory":{"limit":1073741824},"pids":{"limit":64}}"#;
        let res: Resources = serde_json::from_str(json).unwrap();
        assert_eq!(res.memory.unwrap().limit, Some(1_073_741_824));
        assert_eq!(res.pids.unwrap().limit, 64);
    }
}
