//! The ordered mount planner.
//!
//! Mounts are planned in a fixed phase order because later phases may mount
//! onto earlier mountpoints: proc → sys → dev → tmp → home → scratch →
//! system binds (native emulation) → user binds → cwd (native emulation) →
//! GPU binds → library binds. Each phase can be disabled through
//! [`MountPolicy`](crate::launcher::options::MountPolicy); a disabled phase
//! is logged and skipped.

use std::path::{Component, Path, PathBuf};

use ibex_common::{IbexError, IbexResult};
use ibex_oci::Mount;

use crate::filesystem::bind::BindPath;
use crate::filesystem::image::{ImageFormat, ImageMounter};
use crate::launcher::options::LaunchOptions;

/// In-container directory that receives bound host libraries.
pub const CONTAINER_LIBS_DIR: &str = "/.singularity.d/libs";

/// Host library directories searched for GPU userspace libraries.
const HOST_LIB_DIRS: &[&str] = &["/usr/lib64", "/usr/lib/x86_64-linux-gnu", "/usr/lib"];

/// Plans the ordered mount list for one launch.
pub struct MountPlanner<'a> {
    options: &'a LaunchOptions,
    images: &'a mut ImageMounter,
    uid: u32,
    gid: u32,
    home_dest: PathBuf,
    mounts: Vec<Mount>,
}

impl<'a> MountPlanner<'a> {
    /// Create a planner for the given launch.
    pub fn new(
        options: &'a LaunchOptions,
        images: &'a mut ImageMounter,
        uid: u32,
        gid: u32,
        home_dest: impl Into<PathBuf>,
    ) -> Self {
        Self {
            options,
            images,
            uid,
            gid,
            home_dest: home_dest.into(),
            mounts: Vec::new(),
        }
    }

    /// Run every phase in order and return the planned mounts.
    pub fn build(mut self) -> IbexResult<Vec<Mount>> {
        let binds = self.parse_binds()?;
        validate_dev_binds(&binds)?;

        self.add_proc();
        self.add_sys();
        self.add_dev(&binds);
        self.add_tmp();
        self.add_home();
        self.add_scratch();
        if self.options.no_compat {
            self.add_system_binds();
        }
        self.add_user_binds(&binds)?;
        if self.options.no_compat {
            self.add_cwd();
        }
        self.add_gpu_devices();
        self.add_libraries()?;

        Ok(self.mounts)
    }

    fn parse_binds(&self) -> IbexResult<Vec<BindPath>> {
        let mut binds = Vec::new();
        for spec in &self.options.binds {
            binds.push(BindPath::parse(spec)?);
        }
        for spec in &self.options.mounts {
            binds.push(BindPath::parse_mount(spec)?);
        }
        for spec in &self.options.data {
            // A data container is an image bound whole at its destination.
            let mut bind = BindPath::parse(spec)?;
            if bind.image_src.is_none() {
                bind.image_src = Some(PathBuf::from("/"));
            }
            binds.push(bind);
        }
        Ok(binds)
    }

    fn add_proc(&mut self) {
        if !self.options.mount_policy.proc {
            tracing::debug!("skipping /proc mount (disabled by policy)");
            return;
        }
        self.mounts.push(Mount::filesystem(
            "proc",
            "proc",
            "/proc",
            &["nosuid", "noexec", "nodev"],
        ));
    }

    fn add_sys(&mut self) {
        if !self.options.mount_policy.sys {
            tracing::debug!("skipping /sys mount (disabled by policy)");
            return;
        }
        self.mounts.push(Mount::filesystem(
            "sysfs",
            "sysfs",
            "/sys",
            &["nosuid", "noexec", "nodev", "ro"],
        ));
    }

    /// Synthesize a minimal /dev, or rbind the host's when the user bound
    /// `/dev` itself. The full rbind supersedes every synthetic entry but
    /// still gets a fresh devpts instance.
    fn add_dev(&mut self, binds: &[BindPath]) {
        if !self.options.mount_policy.dev {
            tracing::debug!("skipping /dev mounts (disabled by policy)");
            return;
        }

        let full_dev = binds.iter().any(|b| b.source == Path::new("/dev"));
        if full_dev {
            self.mounts
                .push(Mount::bind("/dev", "/dev", &["rbind", "nosuid"]));
        } else {
            self.mounts.push(Mount::filesystem(
                "tmpfs",
                "tmpfs",
                "/dev",
                &["nosuid", "strictatime", "mode=755", "size=65536k"],
            ));
        }

        self.mounts.push(Mount::filesystem(
            "devpts",
            "devpts",
            "/dev/pts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"],
        ));

        if !full_dev {
            self.mounts.push(Mount::filesystem(
                "tmpfs",
                "shm",
                "/dev/shm",
                &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
            ));
            self.mounts.push(Mount::filesystem(
                "mqueue",
                "mqueue",
                "/dev/mqueue",
                &["nosuid", "noexec", "nodev"],
            ));
        }
    }

    fn add_tmp(&mut self) {
        if !self.options.mount_policy.tmp {
            tracing::debug!("skipping /tmp mounts (disabled by policy)");
            return;
        }
        for dest in ["/tmp", "/var/tmp"] {
            self.mounts.push(Mount::filesystem(
                "tmpfs",
                "tmpfs",
                dest,
                &["nosuid", "nodev", "mode=1777"],
            ));
        }
    }

    fn add_home(&mut self) {
        if !self.options.mount_policy.home {
            tracing::debug!("skipping home mount (disabled by policy)");
            return;
        }

        if let Some(home) = &self.options.home {
            let mut opts = vec!["rbind"];
            if !self.options.allow_suid {
                opts.push("nosuid");
            }
            opts.push("nodev");
            self.mounts
                .push(Mount::bind(&home.source, &home.dest, &opts));
        } else {
            // Fresh tmpfs home owned by the target user.
            let opts = format!("uid={},gid={}", self.uid, self.gid);
            self.mounts.push(Mount::filesystem(
                "tmpfs",
                "tmpfs",
                self.home_dest.clone(),
                &["nosuid", "nodev", "mode=755", opts.as_str()],
            ));
        }
    }

    fn add_scratch(&mut self) {
        for dir in &self.options.scratch {
            let opts = format!("uid={},gid={}", self.uid, self.gid);
            self.mounts.push(Mount::filesystem(
                "tmpfs",
                "tmpfs",
                dir.clone(),
                &["nosuid", "nodev", "mode=755", opts.as_str()],
            ));
        }
    }

    /// Host files a native-emulation container expects to see.
    fn add_system_binds(&mut self) {
        for path in ["/etc/hosts", "/etc/localtime"] {
            if Path::new(path).exists() {
                self.mounts
                    .push(Mount::bind(path, path, &["rbind", "nosuid", "nodev", "ro"]));
            } else {
                tracing::debug!(path, "system bind source missing, skipped");
            }
        }
    }

    fn add_user_binds(&mut self, binds: &[BindPath]) -> IbexResult<()> {
        for bind in binds {
            // The /dev rbind was already planned in the dev phase.
            if bind.source == Path::new("/dev") {
                continue;
            }
            let mount = self.plan_bind(bind)?;
            self.mounts.push(mount);
        }
        Ok(())
    }

    /// Turn one bind request into a mount, routing image binds through the
    /// FUSE mounter.
    fn plan_bind(&mut self, bind: &BindPath) -> IbexResult<Mount> {
        let source = if bind.is_image_bind() {
            let format = ImageFormat::from_path(&bind.source).ok_or_else(|| {
                IbexError::config(format!(
                    "cannot determine image format of {}",
                    bind.source.display()
                ))
            })?;
            let mountpoint = self
                .images
                .register(&bind.source, format, !bind.readonly)?;
            let inner = bind
                .image_src
                .as_deref()
                .map(|p| p.strip_prefix("/").unwrap_or(p))
                .unwrap_or_else(|| Path::new(""));
            mountpoint.join(inner)
        } else {
            bind.source.clone()
        };

        if !source.exists() && !self.images.is_pending(&source) {
            return Err(IbexError::config(format!(
                "bind source does not exist: {}",
                source.display()
            )));
        }

        // Sources inside /proc or /sys never get suid or exec rights,
        // whatever allow-suid says.
        let hardened =
            source.starts_with("/proc") || source.starts_with("/sys");

        let mut opts = vec!["rbind"];
        if hardened || !self.options.allow_suid {
            opts.push("nosuid");
        }
        opts.push("nodev");
        if hardened {
            opts.push("noexec");
        }
        if bind.readonly {
            opts.push("ro");
        }

        Ok(Mount::bind(source, &bind.destination, &opts))
    }

    fn add_cwd(&mut self) {
        let Ok(cwd) = std::env::current_dir() else {
            tracing::debug!("current directory unavailable, cwd bind skipped");
            return;
        };
        if self.mounts.iter().any(|m| m.destination == cwd) {
            return;
        }
        let mut opts = vec!["rbind"];
        if !self.options.allow_suid {
            opts.push("nosuid");
        }
        opts.push("nodev");
        self.mounts.push(Mount::bind(&cwd, &cwd, &opts));
    }

    /// GPU device passthrough. Device directories keep device-node access,
    /// so no `nodev` here.
    fn add_gpu_devices(&mut self) {
        if !self.options.mount_policy.gpu {
            tracing::debug!("skipping GPU binds (disabled by policy)");
            return;
        }

        if self.options.rocm {
            for dev in ["/dev/kfd", "/dev/dri"] {
                if Path::new(dev).exists() {
                    self.mounts
                        .push(Mount::bind(dev, dev, &["rbind", "nosuid"]));
                } else {
                    tracing::debug!(dev, "ROCm device missing, skipped");
                }
            }
        }

        if self.options.nvidia {
            for entry in std::fs::read_dir("/dev").into_iter().flatten().flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with("nvidia") {
                    let dev = entry.path();
                    self.mounts
                        .push(Mount::bind(&dev, &dev, &["rbind", "nosuid"]));
                }
            }
        }
    }

    /// Bind GPU userspace libraries and any extra user libraries into the
    /// container library directory.
    fn add_libraries(&mut self) -> IbexResult<()> {
        let mut libs: Vec<PathBuf> = Vec::new();

        if self.options.mount_policy.gpu {
            if self.options.nvidia {
                libs.extend(discover_libraries(&["libcuda.so", "libnvidia-ml.so"]));
            }
            if self.options.rocm {
                libs.extend(discover_libraries(&["libamdhip64.so", "libhsa-runtime64.so"]));
            }
        }

        for lib in &self.options.libraries {
            if !lib.exists() {
                return Err(IbexError::config(format!(
                    "library does not exist: {}",
                    lib.display()
                )));
            }
            libs.push(lib.clone());
        }

        for lib in libs {
            let Some(name) = lib.file_name() else { continue };
            let dest = Path::new(CONTAINER_LIBS_DIR).join(name);
            self.mounts
                .push(Mount::bind(&lib, dest, &["rbind", "nosuid", "nodev", "ro"]));
        }
        Ok(())
    }
}

/// A bind whose source is exactly `/dev` must land on `/dev`.
fn validate_dev_binds(binds: &[BindPath]) -> IbexResult<()> {
    for bind in binds {
        if bind.source == Path::new("/dev") && bind.destination != Path::new("/dev") {
            return Err(IbexError::config(format!(
                "/dev can only be bound to /dev, not {}",
                bind.destination.display()
            )));
        }
    }
    Ok(())
}

/// Find host libraries whose file name starts with one of `prefixes`.
fn discover_libraries(prefixes: &[&str]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in HOST_LIB_DIRS {
        for entry in std::fs::read_dir(dir).into_iter().flatten().flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if prefixes.iter().any(|p| name.starts_with(p)) {
                found.push(entry.path());
            }
        }
    }
    found
}

/// Drop the `/var/tmp` mount when the rootfs links it to `/tmp`.
///
/// Some images ship `/var/tmp -> /tmp`; mounting both would stack a tmpfs
/// on top of the symlink target. Runs as a post-pass once the bundle
/// rootfs exists.
pub fn dedupe_var_tmp(mounts: &mut Vec<Mount>, rootfs: &Path) {
    let Ok(link) = std::fs::read_link(rootfs.join("var/tmp")) else {
        return;
    };
    let resolved = if link.is_absolute() {
        normalize(&link)
    } else {
        normalize(&Path::new("/var").join(link))
    };
    if resolved == Path::new("/tmp") {
        tracing::debug!("/var/tmp resolves to /tmp, dropping duplicate mount");
        mounts.retain(|m| m.destination != Path::new("/var/tmp"));
    }
}

/// Lexical path normalization (folds `.` and `..`).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
