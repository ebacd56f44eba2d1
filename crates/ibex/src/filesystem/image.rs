//! FUSE-backed image mounts.
//!
//! Image-interior binds and filesystem-image overlay layers need the image
//! exposed as a directory before the external runtime starts. Each distinct
//! image file gets a FUSE mount driven by a helper subprocess (`squashfuse`
//! or `fuse2fs`), keyed by absolute image path. An image may be mounted
//! once writable and once read-only through two independent instances, but
//! never writable twice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use ibex_common::{IbexError, IbexResult};

/// Filesystem format of an image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// SquashFS (always read-only).
    SquashFs,
    /// An ext2/3/4 filesystem image.
    ExtFs,
}

impl ImageFormat {
    /// Guess the format from a file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("sqsh" | "squashfs" | "sif") => Some(Self::SquashFs),
            Some("img" | "ext3" | "ext4") => Some(Self::ExtFs),
            _ => None,
        }
    }

    fn helper(self) -> &'static str {
        match self {
            Self::SquashFs => "squashfuse",
            Self::ExtFs => "fuse2fs",
        }
    }
}

/// One registered FUSE mount.
#[derive(Debug)]
struct FuseMount {
    image: PathBuf,
    format: ImageFormat,
    writable: bool,
    mountpoint: PathBuf,
    mounted: bool,
}

/// Registry and driver for the launch's FUSE image mounts.
///
/// `register` is called at mount-plan time and only records intent;
/// `mount_all` runs the helper subprocesses just before the runtime starts,
/// and `unmount_all` is best-effort cleanup after it exits.
#[derive(Debug)]
pub struct ImageMounter {
    staging: PathBuf,
    mounts: Vec<FuseMount>,
    by_image: HashMap<(PathBuf, bool), usize>,
}

impl ImageMounter {
    /// Create a mounter staging its mountpoints under `staging`.
    #[must_use]
    pub fn new(staging: impl Into<PathBuf>) -> Self {
        Self {
            staging: staging.into(),
            mounts: Vec::new(),
            by_image: HashMap::new(),
        }
    }

    /// Register an image mount and return its (future) mountpoint.
    ///
    /// The same image may be registered repeatedly with the same mode and
    /// resolves to one shared mount; a second *writable* registration is a
    /// configuration error.
    pub fn register(
        &mut self,
        image: &Path,
        format: ImageFormat,
        writable: bool,
    ) -> IbexResult<PathBuf> {
        if writable && format == ImageFormat::SquashFs {
            return Err(IbexError::config(format!(
                "squashfs image {} cannot be mounted writable",
                image.display()
            )));
        }

        let image = std::fs::canonicalize(image).map_err(|_| {
            IbexError::config(format!("image file not found: {}", image.display()))
        })?;

        if let Some(&idx) = self.by_image.get(&(image.clone(), writable)) {
            if writable {
                return Err(IbexError::config(format!(
                    "image {} is already mounted writable",
                    image.display()
                )));
            }
            return Ok(self.mounts[idx].mountpoint.clone());
        }

        let mountpoint = self.staging.join(format!(
            "img{}-{}",
            self.mounts.len(),
            if writable { "rw" } else { "ro" }
        ));
        self.mounts.push(FuseMount {
            image: image.clone(),
            format,
            writable,
            mountpoint: mountpoint.clone(),
            mounted: false,
        });
        self.by_image.insert((image, writable), self.mounts.len() - 1);
        Ok(mountpoint)
    }

    /// Whether `path` lies under a registered mountpoint that has not been
    /// materialized yet. The mount planner uses this to exempt such paths
    /// from the missing-source check.
    #[must_use]
    pub fn is_pending(&self, path: &Path) -> bool {
        self.mounts
            .iter()
            .any(|m| !m.mounted && path.starts_with(&m.mountpoint))
    }

    /// Number of registered mounts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether no mounts are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Mount every registered image. Must complete before the external
    /// runtime starts.
    pub fn mount_all(&mut self) -> IbexResult<()> {
        for mount in &mut self.mounts {
            if mount.mounted {
                continue;
            }
            std::fs::create_dir_all(&mount.mountpoint)?;

            let helper = mount.format.helper();
            let mut cmd = Command::new(helper);
            match mount.format {
                ImageFormat::SquashFs => {
                    cmd.arg(&mount.image).arg(&mount.mountpoint);
                }
                ImageFormat::ExtFs => {
                    if !mount.writable {
                        cmd.arg("-o").arg("ro");
                    }
                    cmd.arg(&mount.image).arg(&mount.mountpoint);
                }
            }

            tracing::debug!(
                image = %mount.image.display(),
                mountpoint = %mount.mountpoint.display(),
                helper,
                "Mounting image"
            );

            let output = cmd.output().map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    IbexError::BinaryNotFound {
                        binary: helper.to_string(),
                    }
                } else {
                    e.into()
                }
            })?;

            if !output.status.success() {
                return Err(IbexError::config(format!(
                    "{} failed for {}: {}",
                    helper,
                    mount.image.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
            mount.mounted = true;
        }
        Ok(())
    }

    /// Unmount every mounted image, best effort. Failures are logged, never
    /// returned, so the payload's exit status is preserved.
    pub fn unmount_all(&mut self) {
        for mount in self.mounts.iter_mut().rev() {
            if !mount.mounted {
                continue;
            }
            let status = Command::new("fusermount")
                .arg("-u")
                .arg(&mount.mountpoint)
                .status();
            match status {
                Ok(s) if s.success() => mount.mounted = false,
                Ok(s) => {
                    tracing::warn!(
                        mountpoint = %mount.mountpoint.display(),
                        status = %s,
                        "fusermount -u failed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        mountpoint = %mount.mountpoint.display(),
                        error = %e,
                        "could not run fusermount"
                    );
                }
            }
            if let Err(e) = std::fs::remove_dir(&mount.mountpoint) {
                tracing::debug!(
                    mountpoint = %mount.mountpoint.display(),
                    error = %e,
                    "mountpoint not removed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn format_detection() {
        assert_eq!(
            ImageFormat::from_path(Path::new("/a/data.sqsh")),
            Some(ImageFormat::SquashFs)
        );
        assert_eq!(
            ImageFormat::from_path(Path::new("/a/data.img")),
            Some(ImageFormat::ExtFs)
        );
        assert_eq!(ImageFormat::from_path(Path::new("/a/data.txt")), None);
    }

    #[test]
    fn writable_twice_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("data.img");
        touch(&image);

        let mut mounter = ImageMounter::new(tmp.path().join("staging"));
        mounter
            .register(&image, ImageFormat::ExtFs, true)
            .unwrap();
        let err = mounter
            .register(&image, ImageFormat::ExtFs, true)
            .unwrap_err();
        assert!(err.to_string().contains("already mounted writable"));
    }

    #[test]
    fn writable_and_readonly_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("data.img");
        touch(&image);

        let mut mounter = ImageMounter::new(tmp.path().join("staging"));
        let rw = mounter
            .register(&image, ImageFormat::ExtFs, true)
            .unwrap();
        let ro = mounter
            .register(&image, ImageFormat::ExtFs, false)
            .unwrap();
        assert_ne!(rw, ro);
        assert_eq!(mounter.len(), 2);
    }

    #[test]
    fn readonly_registrations_share_a_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("data.sqsh");
        touch(&image);

        let mut mounter = ImageMounter::new(tmp.path().join("staging"));
        let a = mounter
            .register(&image, ImageFormat::SquashFs, false)
            .unwrap();
        let b = mounter
            .register(&image, ImageFormat::SquashFs, false)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(mounter.len(), 1);
    }

    #[test]
    fn writable_squashfs_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("data.sqsh");
        touch(&image);

        let mut mounter = ImageMounter::new(tmp.path().join("staging"));
        assert!(mounter
            .register(&image, ImageFormat::SquashFs, true)
            .is_err());
    }

    #[test]
    fn pending_mountpoints_are_tracked() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("data.sqsh");
        touch(&image);

        let mut mounter = ImageMounter::new(tmp.path().join("staging"));
        let mp = mounter
            .register(&image, ImageFormat::SquashFs, false)
            .unwrap();
        assert!(mounter.is_pending(&mp.join("inner/dir")));
        assert!(!mounter.is_pending(Path::new("/somewhere/else")));
    }
}
