#![allow(unsafe_code)]
//! Process finalization.
//!
//! Runs once the bundle's image config is available: resolves the target
//! user (adding the nested user namespace when needed), the argv, the
//! merged environment and the capability sets, then writes the supporting
//! `/etc` files into the rootfs.

use std::path::{Path, PathBuf};

use ibex_common::{IbexError, IbexResult};
use ibex_oci::image::ImageExecution;
use ibex_oci::{NamespaceType, Process, Spec, User};

use crate::filesystem::mounts::dedupe_var_tmp;
use crate::launcher::options::LaunchOptions;
use crate::launcher::{capabilities, env, etcfiles, idmap};

/// The account a launch resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    /// UID inside the container.
    pub uid: u32,
    /// GID inside the container.
    pub gid: u32,
    /// Account name for the synthesized passwd entry.
    pub name: String,
    /// Home directory inside the container.
    pub home: PathBuf,
}

/// Finalizes the `Process` section of a spec.
pub struct ProcessComposer<'a> {
    options: &'a LaunchOptions,
    host_uid: u32,
    host_gid: u32,
}

impl<'a> ProcessComposer<'a> {
    /// Composer for the calling user.
    #[must_use]
    pub fn new(options: &'a LaunchOptions) -> Self {
        // SAFETY: getuid/getgid cannot fail.
        let (host_uid, host_gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self::with_ids(options, host_uid, host_gid)
    }

    /// Composer with explicit caller IDs (used by tests).
    #[must_use]
    pub fn with_ids(options: &'a LaunchOptions, host_uid: u32, host_gid: u32) -> Self {
        Self {
            options,
            host_uid,
            host_gid,
        }
    }

    /// Resolve the target account for this launch.
    ///
    /// Defaults to the caller; an image-declared `USER` overrides that, and
    /// `--fakeroot` overrides everything with root.
    pub fn resolve_user(&self, rootfs: &Path, image: &ImageExecution) -> IbexResult<TargetUser> {
        if self.options.fakeroot {
            return Ok(TargetUser {
                uid: 0,
                gid: 0,
                name: "root".to_string(),
                home: PathBuf::from("/root"),
            });
        }

        if let Some(user) = image.user.as_deref().filter(|u| !u.is_empty()) {
            return resolve_image_user(rootfs, user);
        }

        let name = idmap::username_for(self.host_uid);
        let home = self
            .options
            .home
            .as_ref()
            .map(|h| h.dest.clone())
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from(format!("/home/{name}")));
        Ok(TargetUser {
            uid: self.host_uid,
            gid: self.host_gid,
            name,
            home,
        })
    }

    /// Finalize `spec.process` and write the supporting rootfs files.
    pub fn finalize(
        &self,
        rootfs: &Path,
        image: &ImageExecution,
        spec: &mut Spec,
    ) -> IbexResult<()> {
        let target = self.resolve_user(rootfs, image)?;

        // An unprivileged caller running as a non-root target needs the
        // nested namespace with reverse mappings.
        if target.uid != 0 && self.host_uid != 0 {
            let (uid_map, gid_map) =
                idmap::reverse_user_maps(self.host_uid, self.host_gid, target.uid, target.gid)?;
            spec.add_namespace(NamespaceType::User);
            let linux = spec.linux_mut();
            linux.uid_mappings = uid_map;
            linux.gid_mappings = gid_map;
        }

        let args = self.resolve_argv(image)?;

        let host_env: Vec<(String, String)> = std::env::vars().collect();
        let merged_env = env::merge_environment(
            &image.env,
            &host_env,
            &self.options.env_files,
            &self.options.env,
        )?;

        let base = capabilities::baseline(self.options.no_privs, self.options.keep_privs)?;
        let caps = capabilities::compose(
            &base,
            &self.options.add_caps,
            &self.options.drop_caps,
            target.uid,
        )?;

        let cwd = self
            .options
            .cwd
            .clone()
            .or_else(|| image.working_dir.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/"));

        spec.process = Some(Process {
            terminal: false,
            user: User {
                uid: target.uid,
                gid: target.gid,
                umask: self.options.umask,
                additional_gids: Vec::new(),
            },
            args,
            env: merged_env,
            cwd,
            capabilities: Some(caps),
            no_new_privileges: !self.options.allow_suid,
        });

        self.write_rootfs_files(rootfs, image, &target)?;
        dedupe_var_tmp(&mut spec.mounts, rootfs);
        Ok(())
    }

    /// Argv resolution: explicit process beats the entrypoint; explicit
    /// args beat CMD; CMD is only consulted when no process override was
    /// given.
    fn resolve_argv(&self, image: &ImageExecution) -> IbexResult<Vec<String>> {
        let mut argv = Vec::new();

        if let Some(process) = &self.options.process {
            argv.push(process.clone());
            argv.extend(self.options.args.iter().cloned());
        } else {
            argv.extend(image.entrypoint.clone().unwrap_or_default());
            if self.options.args.is_empty() {
                argv.extend(image.cmd.clone().unwrap_or_default());
            } else {
                argv.extend(self.options.args.iter().cloned());
            }
        }

        if argv.is_empty() {
            return Err(IbexError::config(
                "no command: image has no ENTRYPOINT/CMD and none was given".to_string(),
            ));
        }
        Ok(argv)
    }

    fn write_rootfs_files(
        &self,
        rootfs: &Path,
        image: &ImageExecution,
        target: &TargetUser,
    ) -> IbexResult<()> {
        if image.declares_user() {
            // The image's own account database stays authoritative.
            if self.options.home.as_ref().is_some_and(|h| h.custom) {
                return Err(IbexError::config(
                    "--home cannot be used with an image that declares USER".to_string(),
                ));
            }
            tracing::debug!("image declares USER, skipping passwd/group synthesis");
        } else {
            etcfiles::synthesize_passwd(
                rootfs,
                &target.name,
                target.uid,
                target.gid,
                &target.home.to_string_lossy(),
            )?;
            etcfiles::synthesize_group(rootfs, &target.name, target.gid, &target.name)?;
        }

        etcfiles::synthesize_resolv_conf(rootfs, self.options.dns.as_deref())?;
        etcfiles::write_env_script(rootfs, &self.options.env)?;
        Ok(())
    }
}

/// Resolve an image-declared `USER`: `name`, `uid`, `name:group` or
/// `uid:gid`, looked up against the rootfs account files.
fn resolve_image_user(rootfs: &Path, user: &str) -> IbexResult<TargetUser> {
    let (user_part, group_part) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let entry = etcfiles::lookup_passwd(rootfs, user_part)?;
    let (uid, mut gid, name, home) = match entry {
        Some(entry) => (entry.uid, entry.gid, entry.name, PathBuf::from(entry.home)),
        None => {
            let uid: u32 = user_part.parse().map_err(|_| {
                IbexError::config(format!("image USER {user_part:?} not found in container"))
            })?;
            (uid, uid, user_part.to_string(), PathBuf::from("/"))
        }
    };

    if let Some(group) = group_part {
        gid = match etcfiles::lookup_group(rootfs, group)? {
            Some((_, gid)) => gid,
            None => group.parse().map_err(|_| {
                IbexError::config(format!("image group {group:?} not found in container"))
            })?,
        };
    }

    Ok(TargetUser {
        uid,
        gid,
        name,
        home,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibex_oci::Spec;

    fn rootfs() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(
            tmp.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\nsvc:x:500:600:svc:/srv/svc:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("etc/group"), "root:x:0:\nwheel:x:10:\n").unwrap();
        tmp
    }

    fn image(entrypoint: &[&str], cmd: &[&str]) -> ImageExecution {
        ImageExecution {
            entrypoint: (!entrypoint.is_empty())
                .then(|| entrypoint.iter().map(ToString::to_string).collect()),
            cmd: (!cmd.is_empty()).then(|| cmd.iter().map(ToString::to_string).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn entrypoint_with_cmd_when_no_args() {
        let options = LaunchOptions::default();
        let composer = ProcessComposer::with_ids(&options, 1000, 1000);
        let argv = composer
            .resolve_argv(&image(&["/entry"], &["default", "args"]))
            .unwrap();
        assert_eq!(argv, vec!["/entry", "default", "args"]);
    }

    #[test]
    fn explicit_args_replace_cmd() {
        let options = LaunchOptions {
            args: vec!["mine".to_string()],
            ..Default::default()
        };
        let composer = ProcessComposer::with_ids(&options, 1000, 1000);
        let argv = composer
            .resolve_argv(&image(&["/entry"], &["default"]))
            .unwrap();
        assert_eq!(argv, vec!["/entry", "mine"]);
    }

    #[test]
    fn process_override_never_appends_cmd() {
        let options = LaunchOptions {
            process: Some("/bin/sh".to_string()),
            ..Default::default()
        };
        let composer = ProcessComposer::with_ids(&options, 1000, 1000);
        let argv = composer
            .resolve_argv(&image(&["/entry"], &["default"]))
            .unwrap();
        assert_eq!(argv, vec!["/bin/sh"]);
    }

    #[test]
    fn empty_argv_is_an_error() {
        let options = LaunchOptions::default();
        let composer = ProcessComposer::with_ids(&options, 1000, 1000);
        assert!(composer.resolve_argv(&image(&[], &[])).is_err());
    }

    #[test]
    fn fakeroot_overrides_image_user() {
        let tmp = rootfs();
        let options = LaunchOptions {
            fakeroot: true,
            ..Default::default()
        };
        let composer = ProcessComposer::with_ids(&options, 1000, 1000);
        let mut exec = image(&["/entry"], &[]);
        exec.user = Some("svc".to_string());
        let target = composer.resolve_user(tmp.path(), &exec).unwrap();
        assert_eq!((target.uid, target.gid), (0, 0));
    }

    #[test]
    fn image_user_resolves_from_rootfs_passwd() {
        let tmp = rootfs();
        let options = LaunchOptions::default();
        let composer = ProcessComposer::with_ids(&options, 1000, 1000);
        let mut exec = image(&["/entry"], &[]);
        exec.user = Some("svc".to_string());
        let target = composer.resolve_user(tmp.path(), &exec).unwrap();
        assert_eq!(target.uid, 500);
        assert_eq!(target.gid, 600);
        assert_eq!(target.home, PathBuf::from("/srv/svc"));
    }

    #[test]
    fn image_user_with_group_part() {
        let tmp = rootfs();
        let target = resolve_image_user(tmp.path(), "svc:wheel").unwrap();
        assert_eq!((target.uid, target.gid), (500, 10));

        let target = resolve_image_user(tmp.path(), "1234:4321").unwrap();
        assert_eq!((target.uid, target.gid), (1234, 4321));
    }

    #[test]
    fn unknown_image_user_name_is_rejected() {
        let tmp = rootfs();
        assert!(resolve_image_user(tmp.path(), "ghost").is_err());
    }

    #[test]
    fn custom_home_conflicts_with_image_user() {
        let tmp = rootfs();
        let options = LaunchOptions {
            home: Some(crate::launcher::options::HomeSpec::parse("/tmp:/home/me")),
            ..Default::default()
        };
        let composer = ProcessComposer::with_ids(&options, 1000, 1000);
        let mut exec = image(&["/entry"], &[]);
        exec.user = Some("svc".to_string());
        let target = composer.resolve_user(tmp.path(), &exec).unwrap();
        let err = composer
            .write_rootfs_files(tmp.path(), &exec, &target)
            .unwrap_err();
        assert!(err.to_string().contains("--home"));
    }

    #[test]
    fn finalize_sets_process_for_root_caller() {
        // Caller root, target root: no nested userns, full capability sets.
        let tmp = rootfs();
        let options = LaunchOptions {
            process: Some("/bin/true".to_string()),
            ..Default::default()
        };
        let composer = ProcessComposer::with_ids(&options, 0, 0);
        let mut spec = Spec::default();
        composer
            .finalize(tmp.path(), &image(&[], &[]), &mut spec)
            .unwrap();

        let process = spec.process.as_ref().unwrap();
        assert_eq!(process.args, vec!["/bin/true"]);
        assert_eq!(process.user.uid, 0);
        assert!(!spec.has_namespace(NamespaceType::User));
        let caps = process.capabilities.as_ref().unwrap();
        assert!(caps.inheritable.is_empty());
        assert!(caps.ambient.is_empty());
        assert!(!caps.permitted.is_empty());
    }
}
