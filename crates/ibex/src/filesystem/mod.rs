//! Filesystem assembly: bind parsing, the ordered mount planner, overlay
//! stacking and FUSE-backed image mounts.

pub mod bind;
pub mod image;
pub mod mounts;
pub mod overlay;

pub use bind::BindPath;
pub use image::{ImageFormat, ImageMounter};
pub use mounts::{CONTAINER_LIBS_DIR, MountPlanner, dedupe_var_tmp};
pub use overlay::{OverlayCoordinator, OverlayItem, OverlayKind, OverlaySet};
