//! Container Device Interface support.
//!
//! CDI spec files describe vendor devices as edits to an OCI runtime
//! configuration. The registry scans spec directories and resolves
//! `vendor.domain/class=name` selectors; `refresh()` runs before every
//! injection, so spec files dropped in while the launcher is running are
//! picked up.
//!
//! <https://github.com/cncf-tags/container-device-interface>

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ibex_common::{IbexError, IbexResult};
use ibex_oci::{LinuxDevice, LinuxDeviceCgroup, Mount, Resources, Spec};

/// Directories searched when the user supplies none.
pub const DEFAULT_CDI_DIRS: &[&str] = &["/etc/cdi", "/var/run/cdi"];

/// A CDI specification file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    /// CDI specification version.
    pub cdi_version: String,
    /// Device kind, `vendor.domain/class`.
    pub kind: String,
    /// Devices of this kind.
    #[serde(default)]
    pub devices: Vec<CdiDevice>,
    /// Edits applied for every device of this kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_edits: Option<ContainerEdits>,
}

/// One named device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    /// Device name, the part after `=` in a selector.
    pub name: String,
    /// Edits this device contributes.
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

/// Spec edits contributed by a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    /// Environment variables to append.
    #[serde(default)]
    pub env: Vec<String>,
    /// Device nodes to create.
    #[serde(default)]
    pub device_nodes: Vec<DeviceNode>,
    /// Mounts to add.
    #[serde(default)]
    pub mounts: Vec<CdiMount>,
}

/// A device node edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    /// In-container device path.
    pub path: PathBuf,
    /// Device type (c or b).
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,
    /// Major number.
    #[serde(default)]
    pub major: i64,
    /// Minor number.
    #[serde(default)]
    pub minor: i64,
    /// File mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_mode: Option<u32>,
}

fn default_device_type() -> String {
    "c".to_string()
}

/// A mount edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiMount {
    /// Host path.
    pub host_path: PathBuf,
    /// In-container path.
    pub container_path: PathBuf,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

/// A parsed `vendor.domain/class=name` selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector {
    /// The `vendor.domain/class` part.
    pub kind: String,
    /// The device name.
    pub name: String,
}

impl DeviceSelector {
    /// Parse a selector string.
    pub fn parse(selector: &str) -> IbexResult<Self> {
        let (kind, name) = selector.split_once('=').ok_or_else(|| {
            IbexError::config(format!(
                "CDI selector must be vendor.domain/class=name, got {selector:?}"
            ))
        })?;
        if !kind.contains('/') || !kind.split('/').next().is_some_and(|v| v.contains('.')) {
            return Err(IbexError::config(format!(
                "CDI selector kind must be vendor.domain/class, got {kind:?}"
            )));
        }
        if name.is_empty() {
            return Err(IbexError::config(format!(
                "CDI selector has an empty device name: {selector:?}"
            )));
        }
        Ok(Self {
            kind: kind.to_string(),
            name: name.to_string(),
        })
    }
}

/// Registry of CDI specs, constructed once and refreshed on demand.
#[derive(Debug)]
pub struct CdiRegistry {
    dirs: Vec<PathBuf>,
    specs: Vec<CdiSpec>,
}

impl CdiRegistry {
    /// Registry over the given directories, or the defaults when empty.
    #[must_use]
    pub fn new(dirs: &[PathBuf]) -> Self {
        let dirs = if dirs.is_empty() {
            DEFAULT_CDI_DIRS.iter().map(PathBuf::from).collect()
        } else {
            dirs.to_vec()
        };
        Self {
            dirs,
            specs: Vec::new(),
        }
    }

    /// Rescan every registered directory for `.json` spec files.
    pub fn refresh(&mut self) -> IbexResult<()> {
        self.specs.clear();
        for dir in &self.dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match load_spec(&path) {
                    Ok(spec) => self.specs.push(spec),
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "skipping unreadable CDI spec");
                    }
                }
            }
        }
        tracing::debug!(specs = self.specs.len(), "CDI registry refreshed");
        Ok(())
    }

    /// Resolve every selector and apply its edits to the spec.
    ///
    /// Refreshes first, so the registry never serves stale device lists.
    pub fn inject(&mut self, spec: &mut Spec, selectors: &[String]) -> IbexResult<()> {
        if selectors.is_empty() {
            return Ok(());
        }
        self.refresh()?;

        for selector in selectors {
            let parsed = DeviceSelector::parse(selector)?;
            let (device, kind_edits) = self.lookup(&parsed).ok_or_else(|| {
                IbexError::DeviceNotFound {
                    selector: selector.clone(),
                }
            })?;
            let device = device.clone();
            let kind_edits = kind_edits.cloned();

            apply_edits(spec, &device.container_edits);
            if let Some(edits) = kind_edits {
                apply_edits(spec, &edits);
            }
            tracing::debug!(selector, "CDI device injected");
        }
        Ok(())
    }

    fn lookup(&self, selector: &DeviceSelector) -> Option<(&CdiDevice, Option<&ContainerEdits>)> {
        for spec in &self.specs {
            if spec.kind != selector.kind {
                continue;
            }
            if let Some(device) = spec.devices.iter().find(|d| d.name == selector.name) {
                return Some((device, spec.container_edits.as_ref()));
            }
        }
        None
    }
}

fn load_spec(path: &Path) -> IbexResult<CdiSpec> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data).map_err(IbexError::from)?)
}

/// Fold one set of edits into the runtime spec.
fn apply_edits(spec: &mut Spec, edits: &ContainerEdits) {
    if !edits.env.is_empty() {
        if let Some(process) = spec.process.as_mut() {
            process.env.extend(edits.env.iter().cloned());
        }
    }

    for mount in &edits.mounts {
        spec.mounts.push(Mount {
            destination: mount.container_path.clone(),
            mount_type: None,
            source: Some(mount.host_path.clone()),
            options: if mount.options.is_empty() {
                vec!["rbind".to_string(), "nosuid".to_string()]
            } else {
                mount.options.clone()
            },
        });
    }

    for node in &edits.device_nodes {
        let linux = spec.linux_mut();
        linux.devices.push(LinuxDevice {
            path: node.path.clone(),
            device_type: node.device_type.clone(),
            major: node.major,
            minor: node.minor,
            file_mode: node.file_mode,
            uid: None,
            gid: None,
        });
        linux
            .resources
            .get_or_insert_with(Resources::default)
            .devices
            .push(LinuxDeviceCgroup {
                allow: true,
                device_type: Some(node.device_type.clone()),
                major: Some(node.major),
                minor: Some(node.minor),
                access: Some("rwm".to_string()),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibex_oci::Process;

    fn write_spec(dir: &Path) {
        let spec = r#"{
            "cdiVersion": "0.6.0",
            "kind": "vendor.example/gpu",
            "containerEdits": {
                "env": ["VENDOR_VISIBLE_DEVICES=all"]
            },
            "devices": [
                {
                    "name": "gpu0",
                    "containerEdits": {
                        "deviceNodes": [
                            {"path": "/dev/vendor0", "type": "c", "major": 195, "minor": 0}
                        ],
                        "mounts": [
                            {"hostPath": "/usr/lib/libvendor.so", "containerPath": "/usr/lib/libvendor.so"}
                        ]
                    }
                }
            ]
        }"#;
        std::fs::write(dir.join("vendor.json"), spec).unwrap();
    }

    #[test]
    fn selector_parsing() {
        let sel = DeviceSelector::parse("nvidia.com/gpu=gpu0").unwrap();
        assert_eq!(sel.kind, "nvidia.com/gpu");
        assert_eq!(sel.name, "gpu0");

        assert!(DeviceSelector::parse("gpu0").is_err());
        assert!(DeviceSelector::parse("nodomain/gpu=gpu0").is_err());
        assert!(DeviceSelector::parse("nvidia.com/gpu=").is_err());
    }

    #[test]
    fn inject_applies_device_and_kind_edits() {
        let tmp = tempfile::tempdir().unwrap();
        write_spec(tmp.path());

        let mut registry = CdiRegistry::new(&[tmp.path().to_path_buf()]);
        let mut spec = Spec {
            process: Some(Process::default()),
            ..Default::default()
        };
        registry
            .inject(&mut spec, &["vendor.example/gpu=gpu0".to_string()])
            .unwrap();

        let linux = spec.linux.as_ref().unwrap();
        assert_eq!(linux.devices.len(), 1);
        assert_eq!(linux.devices[0].major, 195);
        assert_eq!(linux.resources.as_ref().unwrap().devices.len(), 1);
        assert_eq!(spec.mounts.len(), 1);
        assert!(spec
            .process
            .unwrap()
            .env
            .contains(&"VENDOR_VISIBLE_DEVICES=all".to_string()));
    }

    #[test]
    fn unknown_device_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_spec(tmp.path());

        let mut registry = CdiRegistry::new(&[tmp.path().to_path_buf()]);
        let mut spec = Spec::default();
        let err = registry
            .inject(&mut spec, &["vendor.example/gpu=gpu9".to_string()])
            .unwrap_err();
        assert!(matches!(err, IbexError::DeviceNotFound { .. }));
    }

    #[test]
    fn refresh_picks_up_new_specs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut registry = CdiRegistry::new(&[tmp.path().to_path_buf()]);
        registry.refresh().unwrap();
        assert!(registry.specs.is_empty());

        write_spec(tmp.path());
        registry.refresh().unwrap();
        assert_eq!(registry.specs.len(), 1);
    }

    #[test]
    fn empty_selector_list_is_a_no_op() {
        let mut registry = CdiRegistry::new(&[]);
        let mut spec = Spec::default();
        registry.inject(&mut spec, &[]).unwrap();
        assert!(spec.mounts.is_empty());
    }
}
