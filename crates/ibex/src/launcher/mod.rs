//! Launch orchestration.
//!
//! The happy path is sequential: build the skeleton spec, open the bundle
//! (taking its lock), finalize the process once the image config is known,
//! inject CDI devices, write `config.json`, then run the container inside
//! the overlay stack and delete it afterwards. Cleanup runs on every exit
//! path once the bundle lock is held, and only ever logs its failures so
//! the run's own result survives.

pub mod capabilities;
pub mod env;
pub mod etcfiles;
pub mod idmap;
pub mod options;
pub mod process;
pub mod spec;

use std::path::Path;

use ibex_common::IbexResult;

use crate::bundle::{BundleHandle, BundleSupervisor};
use crate::cdi::CdiRegistry;
use crate::filesystem::image::ImageMounter;
use crate::filesystem::overlay::{OverlayCoordinator, OverlaySet};

pub use options::{HomeSpec, LaunchOptions, MountPolicy, NetworkMode};
pub use process::ProcessComposer;
pub use spec::SpecBuilder;

/// Drives one container launch end to end.
pub struct Launcher {
    options: LaunchOptions,
    cdi: CdiRegistry,
}

impl Launcher {
    /// Launcher for a request; the CDI registry is constructed once here
    /// and refreshed per injection.
    #[must_use]
    pub fn new(options: LaunchOptions) -> Self {
        let cdi = CdiRegistry::new(&options.cdi_dirs);
        Self { options, cdi }
    }

    /// Launch the container in `bundle_dir` and return its exit code.
    pub fn launch(&mut self, bundle_dir: &Path, container_id: &str) -> IbexResult<i32> {
        let options = &self.options;
        let cdi = &mut self.cdi;

        let builder = SpecBuilder::new(options);
        let mut images = ImageMounter::new(bundle_dir.join("image-mounts"));
        let mut spec = builder.create_spec(container_id, &mut images)?;

        let bundle = BundleHandle::create(bundle_dir)?;
        let supervisor = match BundleSupervisor::new(container_id) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                bundle.release();
                return Err(e);
            }
        };

        let result = (|| -> IbexResult<i32> {
            let composer = ProcessComposer::new(options);
            composer.finalize(&bundle.rootfs(), &bundle.image().execution(), &mut spec)?;

            cdi.inject(&mut spec, &options.devices)?;
            spec.save(bundle.path())?;

            let overlays = OverlaySet::parse(&options.overlays, options.allow_suid)?;
            OverlayCoordinator::new(overlays)
                .wrap(bundle.path(), &mut images, || supervisor.run(&bundle))
        })();

        // Deletion always runs once the lock is held; its failures are
        // logged so they never mask the run's result.
        if let Err(e) = supervisor.delete(bundle) {
            tracing::warn!(id = container_id, error = %e, "bundle cleanup failed");
        }
        result
    }
}
