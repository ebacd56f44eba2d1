//! Bundle handling and the lifecycle supervisor.
//!
//! A *bundle* is a directory with an extracted rootfs under `rootfs/`, the
//! image config the extractor left at `image-config.json`, and the
//! `config.json` this launcher writes. [`BundleHandle`] owns the bundle and
//! its advisory lock; [`supervisor::BundleSupervisor`] drives the external
//! runtime and its logging helper against it.

pub mod attach;
pub mod lock;
pub mod supervisor;

use std::path::{Path, PathBuf};

use ibex_common::{IbexError, IbexResult};
use ibex_oci::ImageConfig;

pub use lock::BundleLock;
pub use supervisor::BundleSupervisor;

/// File the image extractor leaves next to the rootfs.
const IMAGE_CONFIG_FILE: &str = "image-config.json";

/// An open bundle: path, image spec and the held lock.
#[derive(Debug)]
pub struct BundleHandle {
    path: PathBuf,
    image: ImageConfig,
    lock: BundleLock,
}

impl BundleHandle {
    /// Open a bundle directory, acquiring its lock.
    ///
    /// The rootfs must already be extracted; a missing `rootfs/` is a
    /// configuration error, not something the launcher repairs.
    pub fn create(path: &Path) -> IbexResult<Self> {
        let lock = BundleLock::acquire(path)?;

        let rootfs = path.join("rootfs");
        if !rootfs.is_dir() {
            return Err(IbexError::config(format!(
                "bundle has no extracted rootfs at {}",
                rootfs.display()
            )));
        }

        let config_path = path.join(IMAGE_CONFIG_FILE);
        let image = if config_path.exists() {
            ImageConfig::from_file(&config_path)?
        } else {
            tracing::debug!(bundle = %path.display(), "no image config in bundle, using defaults");
            ImageConfig::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            image,
            lock,
        })
    }

    /// The bundle directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The extracted rootfs directory.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.path.join("rootfs")
    }

    /// The image configuration.
    #[must_use]
    pub fn image(&self) -> &ImageConfig {
        &self.image
    }

    /// Release the bundle lock, consuming the handle.
    pub fn release(self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_dir() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("rootfs")).unwrap();
        tmp
    }

    #[test]
    fn create_requires_rootfs() {
        let tmp = tempfile::tempdir().unwrap();
        let err = BundleHandle::create(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("rootfs"));
    }

    #[test]
    fn create_holds_the_lock() {
        let tmp = bundle_dir();
        let handle = BundleHandle::create(tmp.path()).unwrap();
        assert!(matches!(
            BundleHandle::create(tmp.path()).unwrap_err(),
            IbexError::BundleLocked { .. }
        ));
        handle.release();
        assert!(BundleHandle::create(tmp.path()).is_ok());
    }

    #[test]
    fn image_config_is_loaded_when_present() {
        let tmp = bundle_dir();
        std::fs::write(
            tmp.path().join(IMAGE_CONFIG_FILE),
            r#"{"architecture":"amd64","os":"linux","config":{"Entrypoint":["/bin/app"]}}"#,
        )
        .unwrap();
        let handle = BundleHandle::create(tmp.path()).unwrap();
        assert_eq!(
            handle.image().execution().entrypoint.unwrap(),
            vec!["/bin/app"]
        );
    }
}
