//! OCI specification types used by the ibex launcher.
//!
//! The launcher assembles a runtime configuration (`config.json`) for an
//! external OCI runtime and reads back the image execution config and the
//! runtime's state reports. Only the surface the launcher actually emits or
//! consumes is modelled here; defaults the external runtime owns (seccomp
//! profiles, hooks) are intentionally absent.

pub mod image;
pub mod runtime;
pub mod state;

pub use image::{ImageConfig, ImageExecution};
pub use runtime::{
    Capabilities, IdMapping, Linux, LinuxDevice, LinuxDeviceCgroup, Mount, Namespace,
    NamespaceType, Process, Resources, Root, Spec, User,
};
pub use state::{ContainerState, ContainerStatus};
