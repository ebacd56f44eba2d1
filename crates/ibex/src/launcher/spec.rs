#![allow(unsafe_code)]
//! Skeleton spec assembly.
//!
//! `SpecBuilder` produces the namespace-bearing spec before the image
//! config is known: root path and read-only flag, the namespace union, the
//! planned mount list and the optional cgroup resources. The process
//! section stays empty until [`ProcessComposer`](super::process) runs.

use std::path::{Path, PathBuf};

use ibex_common::{IbexError, IbexResult};
use ibex_oci::{NamespaceType, Resources, Root, Spec};

use crate::filesystem::image::ImageMounter;
use crate::filesystem::mounts::MountPlanner;
use crate::filesystem::overlay::OverlaySet;
use crate::launcher::options::{LaunchOptions, NetworkMode};

/// Annotation telling crun to keep the caller's supplementary groups.
const KEEP_GROUPS_ANNOTATION: &str = "run.oci.keep_original_groups";

/// Builds the skeleton spec for a launch.
pub struct SpecBuilder<'a> {
    options: &'a LaunchOptions,
    host_uid: u32,
    host_gid: u32,
}

impl<'a> SpecBuilder<'a> {
    /// Builder for the calling user.
    #[must_use]
    pub fn new(options: &'a LaunchOptions) -> Self {
        // SAFETY: getuid/getgid cannot fail.
        let (host_uid, host_gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self::with_ids(options, host_uid, host_gid)
    }

    /// Builder with explicit caller IDs (used by tests).
    #[must_use]
    pub fn with_ids(options: &'a LaunchOptions, host_uid: u32, host_gid: u32) -> Self {
        Self {
            options,
            host_uid,
            host_gid,
        }
    }

    /// The IDs the container process will run as, as far as they are known
    /// before the image config arrives.
    #[must_use]
    pub fn target_ids(&self) -> (u32, u32) {
        if self.options.fakeroot {
            (0, 0)
        } else {
            (self.host_uid, self.host_gid)
        }
    }

    /// Home destination inside the container.
    #[must_use]
    pub fn home_dest(&self) -> PathBuf {
        if let Some(home) = &self.options.home {
            return home.dest.clone();
        }
        if self.options.fakeroot {
            return PathBuf::from("/root");
        }
        dirs::home_dir().unwrap_or_else(|| {
            PathBuf::from(format!("/home/{}", super::idmap::username_for(self.host_uid)))
        })
    }

    /// Assemble the skeleton spec, planning mounts through `images`.
    pub fn create_spec(&self, container_id: &str, images: &mut ImageMounter) -> IbexResult<Spec> {
        let overlays = OverlaySet::parse(&self.options.overlays, self.options.allow_suid)?;
        let (uid, gid) = self.target_ids();

        let mut spec = Spec {
            root: Some(Root {
                path: PathBuf::from("rootfs"),
                readonly: !self.options.writable_tmpfs && !overlays.has_writable(),
            }),
            hostname: self.options.hostname.clone(),
            ..Default::default()
        };

        // Always-on namespaces.
        spec.add_namespace(NamespaceType::Ipc);
        spec.add_namespace(NamespaceType::Mount);

        if matches!(self.options.network, NetworkMode::None) {
            spec.add_namespace(NamespaceType::Network);
        }
        if !self.options.no_pid_ns {
            spec.add_namespace(NamespaceType::Pid);
        }
        if self.options.hostname.is_some() {
            spec.add_namespace(NamespaceType::Uts);
        }
        if self.host_uid != 0 {
            spec.add_namespace(NamespaceType::User);
        }

        spec.mounts =
            MountPlanner::new(self.options, images, uid, gid, self.home_dest()).build()?;

        if let Some(json) = &self.options.cgroup_json {
            if !cgroups_manageable(self.host_uid) {
                return Err(IbexError::config(
                    "cgroup resource limits requested but cgroup management is not available"
                        .to_string(),
                ));
            }
            let resources: Resources = serde_json::from_str(json).map_err(|e| {
                IbexError::config(format!("invalid cgroup resource JSON: {e}"))
            })?;
            let linux = spec.linux_mut();
            linux.resources = Some(resources);
            linux.cgroups_path = Some(format!("singularity/{container_id}"));
        }

        if self.options.no_setgroups {
            spec.annotations
                .insert(KEEP_GROUPS_ANNOTATION.to_string(), "1".to_string());
        }

        Ok(spec)
    }
}

/// Whether this host can apply cgroup limits for the caller.
///
/// Root can manage any hierarchy; an unprivileged caller needs the unified
/// cgroup v2 hierarchy for delegation.
fn cgroups_manageable(host_uid: u32) -> bool {
    if host_uid == 0 {
        Path::new("/sys/fs/cgroup").is_dir()
    } else {
        Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(options: &LaunchOptions, uid: u32) -> IbexResult<Spec> {
        let staging = std::env::temp_dir().join("ibex-specbuilder-test");
        let mut images = ImageMounter::new(staging);
        SpecBuilder::with_ids(options, uid, uid).create_spec("c1", &mut images)
    }

    #[test]
    fn always_on_namespaces() {
        let spec = build(&LaunchOptions::default(), 1000).unwrap();
        assert!(spec.has_namespace(NamespaceType::Ipc));
        assert!(spec.has_namespace(NamespaceType::Mount));
        assert!(spec.has_namespace(NamespaceType::Pid));
        assert!(!spec.has_namespace(NamespaceType::Network));
        assert!(!spec.has_namespace(NamespaceType::Uts));
    }

    #[test]
    fn unprivileged_caller_gets_user_namespace() {
        let spec = build(&LaunchOptions::default(), 1000).unwrap();
        assert!(spec.has_namespace(NamespaceType::User));

        let spec = build(&LaunchOptions::default(), 0).unwrap();
        assert!(!spec.has_namespace(NamespaceType::User));
    }

    #[test]
    fn pid_namespace_can_be_suppressed() {
        let options = LaunchOptions {
            no_pid_ns: true,
            ..Default::default()
        };
        let spec = build(&options, 1000).unwrap();
        assert!(!spec.has_namespace(NamespaceType::Pid));
    }

    #[test]
    fn hostname_implies_uts_namespace() {
        let options = LaunchOptions {
            hostname: Some("node-7".to_string()),
            ..Default::default()
        };
        let spec = build(&options, 1000).unwrap();
        assert!(spec.has_namespace(NamespaceType::Uts));
        assert_eq!(spec.hostname.as_deref(), Some("node-7"));
    }

    #[test]
    fn network_none_adds_namespace() {
        let options = LaunchOptions {
            network: NetworkMode::None,
            ..Default::default()
        };
        let spec = build(&options, 1000).unwrap();
        assert!(spec.has_namespace(NamespaceType::Network));
    }

    #[test]
    fn root_is_readonly_unless_writable_requested() {
        let spec = build(&LaunchOptions::default(), 1000).unwrap();
        assert!(spec.root.as_ref().unwrap().readonly);

        let options = LaunchOptions {
            writable_tmpfs: true,
            ..Default::default()
        };
        let spec = build(&options, 1000).unwrap();
        assert!(!spec.root.as_ref().unwrap().readonly);
    }

    #[test]
    fn writable_overlay_makes_root_writable() {
        let tmp = tempfile::tempdir().unwrap();
        let layer = tmp.path().join("layer");
        std::fs::create_dir_all(&layer).unwrap();

        let options = LaunchOptions {
            overlays: vec![layer.display().to_string()],
            ..Default::default()
        };
        let spec = build(&options, 1000).unwrap();
        assert!(!spec.root.as_ref().unwrap().readonly);
    }

    #[test]
    fn invalid_cgroup_json_is_rejected() {
        let options = LaunchOptions {
            cgroup_json: Some("{not json".to_string()),
            ..Default::default()
        };
        // Either unsupported-host or parse error; both must fail.
        assert!(build(&options, 1000).is_err());
    }

    #[test]
    fn no_setgroups_sets_annotation() {
        let options = LaunchOptions {
            no_setgroups: true,
            ..Default::default()
        };
        let spec = build(&options, 1000).unwrap();
        assert_eq!(
            spec.annotations.get(KEEP_GROUPS_ANNOTATION).map(String::as_str),
            Some("1")
        );
    }
}
