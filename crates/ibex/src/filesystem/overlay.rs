//! Overlay stacking around the container run.
//!
//! User overlays plus rootfs form an overlayfs stack with exactly one
//! writable layer. When the user supplies none, an ephemeral tmpfs layer is
//! synthesized so the launcher can still inject `/etc` files into an
//! otherwise read-only image. Mounting brackets the whole run: the stack is
//! mounted before the external runtime starts and unmounted after it exits,
//! on success and failure alike.

use std::path::{Path, PathBuf};

use ibex_common::{IbexError, IbexResult};

use crate::filesystem::image::{ImageFormat, ImageMounter};

/// Backing store of one overlay layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayKind {
    /// A plain host directory.
    Dir,
    /// A squashfs image (read-only by construction).
    SquashFs,
    /// An ext2/3/4 filesystem image.
    ExtFs,
    /// A layer of an OCI-SIF image, exposed by the image backend.
    OciSifLayer,
}

/// One parsed overlay argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayItem {
    /// Host path of the directory or image.
    pub source: PathBuf,
    /// Backing kind.
    pub kind: OverlayKind,
    /// Whether the layer is read-only.
    pub readonly: bool,
    /// Whether setuid binaries in the layer stay effective.
    pub allow_setuid: bool,
}

impl OverlayItem {
    /// Parse an `--overlay` argument: `path[:ro]`.
    pub fn parse(spec: &str, allow_setuid: bool) -> IbexResult<Self> {
        let (path, readonly) = match spec.rsplit_once(':') {
            Some((path, "ro")) => (path, true),
            Some((path, "rw")) => (path, false),
            _ => (spec, false),
        };
        let source = PathBuf::from(path);
        if !source.exists() {
            return Err(IbexError::config(format!(
                "overlay source does not exist: {path}"
            )));
        }

        let kind = if source.is_dir() {
            OverlayKind::Dir
        } else {
            match ImageFormat::from_path(&source) {
                Some(ImageFormat::SquashFs) => OverlayKind::SquashFs,
                Some(ImageFormat::ExtFs) => OverlayKind::ExtFs,
                None => {
                    return Err(IbexError::config(format!(
                        "cannot determine overlay image format: {path}"
                    )));
                }
            }
        };

        if kind == OverlayKind::SquashFs && !readonly {
            return Err(IbexError::config(format!(
                "squashfs overlay {path} must be marked :ro"
            )));
        }

        Ok(Self {
            source,
            kind,
            readonly,
            allow_setuid,
        })
    }

    /// An OCI-SIF layer exposed by the image backend, always read-only.
    #[must_use]
    pub fn ocisif_layer(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            kind: OverlayKind::OciSifLayer,
            readonly: true,
            allow_setuid: false,
        }
    }
}

/// A validated overlay stack for one launch.
#[derive(Debug, Clone, Default)]
pub struct OverlaySet {
    items: Vec<OverlayItem>,
}

impl OverlaySet {
    /// Parse overlay arguments, enforcing the single-writable invariant.
    pub fn parse(specs: &[String], allow_setuid: bool) -> IbexResult<Self> {
        let items = specs
            .iter()
            .map(|s| OverlayItem::parse(s, allow_setuid))
            .collect::<IbexResult<Vec<_>>>()?;

        let writable = items.iter().filter(|i| !i.readonly).count();
        if writable > 1 {
            return Err(IbexError::config(format!(
                "at most one overlay may be writable, found {writable}"
            )));
        }
        Ok(Self { items })
    }

    /// The overlay items, in stacking order.
    #[must_use]
    pub fn items(&self) -> &[OverlayItem] {
        &self.items
    }

    /// Whether the user supplied a writable layer.
    #[must_use]
    pub fn has_writable(&self) -> bool {
        self.items.iter().any(|i| !i.readonly)
    }
}

/// The ephemeral writable layer synthesized when the user supplied none.
#[derive(Debug)]
struct EphemeralLayer {
    dir: PathBuf,
    mounted: bool,
}

impl EphemeralLayer {
    /// Mount a tmpfs at `dir` and create `upper`/`work` inside it.
    fn create(dir: PathBuf) -> IbexResult<Self> {
        std::fs::create_dir_all(&dir)?;
        mount_tmpfs(&dir)?;
        let layer = Self { dir, mounted: true };
        std::fs::create_dir_all(layer.upper())?;
        std::fs::create_dir_all(layer.work())?;
        Ok(layer)
    }

    fn upper(&self) -> PathBuf {
        self.dir.join("upper")
    }

    fn work(&self) -> PathBuf {
        self.dir.join("work")
    }

    /// Unmount and delete; failures are logged, never propagated.
    fn cleanup(mut self) {
        if self.mounted {
            if let Err(e) = unmount_detach(&self.dir) {
                tracing::warn!(dir = %self.dir.display(), error = %e, "ephemeral layer unmount failed");
                return;
            }
            self.mounted = false;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "ephemeral layer removal failed");
        }
    }
}

/// Mounts the overlay stack around a payload.
pub struct OverlayCoordinator {
    set: OverlaySet,
}

impl OverlayCoordinator {
    /// Coordinator for a validated overlay set.
    #[must_use]
    pub fn new(set: OverlaySet) -> Self {
        Self { set }
    }

    /// Mount the stack onto `<bundle>/rootfs`, run the payload, and tear
    /// everything down again. Cleanup failures are logged so the payload's
    /// result always wins.
    pub fn wrap<T>(
        &self,
        bundle: &Path,
        images: &mut ImageMounter,
        payload: impl FnOnce() -> IbexResult<T>,
    ) -> IbexResult<T> {
        let rootfs = bundle.join("rootfs");

        // Resolve each layer to a directory, registering image-backed
        // layers with the FUSE mounter.
        let mut lowers: Vec<PathBuf> = Vec::new();
        let mut upper_work: Option<(PathBuf, PathBuf)> = None;
        let mut layer_mounts = Vec::new();

        for item in self.set.items() {
            let dir = match item.kind {
                OverlayKind::Dir => item.source.clone(),
                OverlayKind::SquashFs | OverlayKind::OciSifLayer => {
                    images.register(&item.source, ImageFormat::SquashFs, false)?
                }
                OverlayKind::ExtFs => {
                    images.register(&item.source, ImageFormat::ExtFs, !item.readonly)?
                }
            };
            if item.readonly {
                lowers.push(dir);
            } else {
                // Writable layers carry their own upper/work pair.
                upper_work = Some((dir.join("upper"), dir.join("work")));
                layer_mounts.push(dir);
            }
        }

        // The FUSE mounts must exist before overlayfs references them.
        images.mount_all()?;

        let ephemeral = if upper_work.is_none() {
            let layer = EphemeralLayer::create(bundle.join("overlay-ephemeral"))?;
            upper_work = Some((layer.upper(), layer.work()));
            Some(layer)
        } else {
            for dir in &layer_mounts {
                std::fs::create_dir_all(dir.join("upper"))?;
                std::fs::create_dir_all(dir.join("work"))?;
            }
            None
        };
        let (upper, work) = upper_work.expect("writable layer resolved above");

        // Rootfs is the lowest layer; user overlays stack above it.
        lowers.push(rootfs.clone());

        let result = mount_overlay(&lowers, &upper, &work, &rootfs).and_then(|()| {
            let result = payload();
            if let Err(e) = unmount_detach(&rootfs) {
                tracing::warn!(rootfs = %rootfs.display(), error = %e, "overlay unmount failed");
            }
            result
        });

        if let Some(layer) = ephemeral {
            layer.cleanup();
        }
        images.unmount_all();

        result
    }
}

/// Overlayfs mount options for a stack.
fn overlay_options(lowers: &[PathBuf], upper: &Path, work: &Path) -> String {
    let lower = lowers
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":");
    format!(
        "lowerdir={},upperdir={},workdir={}",
        lower,
        upper.display(),
        work.display()
    )
}

#[cfg(target_os = "linux")]
fn mount_overlay(lowers: &[PathBuf], upper: &Path, work: &Path, target: &Path) -> IbexResult<()> {
    use rustix::mount::{MountFlags, mount};
    use std::ffi::CString;

    let options = overlay_options(lowers, upper, work);
    tracing::debug!(target = %target.display(), options = %options, "Mounting overlayfs");

    let fstype = CString::new("overlay").expect("static string");
    let options_c = CString::new(options.as_str()).map_err(|_| {
        IbexError::config("overlay options contain a null byte".to_string())
    })?;

    mount(
        "overlay",
        target,
        fstype.as_c_str(),
        MountFlags::empty(),
        options_c.as_c_str(),
    )
    .map_err(|e| IbexError::Io(e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn mount_overlay(_: &[PathBuf], _: &Path, _: &Path, _: &Path) -> IbexResult<()> {
    Err(IbexError::config("overlayfs requires Linux".to_string()))
}

#[cfg(target_os = "linux")]
fn mount_tmpfs(target: &Path) -> IbexResult<()> {
    use rustix::mount::{MountFlags, mount};
    use std::ffi::CString;

    let fstype = CString::new("tmpfs").expect("static string");
    let data = CString::new("mode=0755").expect("static string");
    mount("tmpfs", target, fstype.as_c_str(), MountFlags::empty(), data.as_c_str())
        .map_err(|e| IbexError::Io(e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn mount_tmpfs(_: &Path) -> IbexResult<()> {
    Err(IbexError::config("tmpfs mounts require Linux".to_string()))
}

#[cfg(target_os = "linux")]
fn unmount_detach(target: &Path) -> IbexResult<()> {
    use rustix::mount::{UnmountFlags, unmount};

    unmount(target, UnmountFlags::DETACH).map_err(|e| IbexError::Io(e.into()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn unmount_detach(_: &Path) -> IbexResult<()> {
    Err(IbexError::config("unmount requires Linux".to_string()))
}
