//! # ibex
//!
//! ibex is an OCI-mode container launcher for HPC workloads. It translates a
//! launch request plus an extracted OCI image into a running, isolated
//! process tree by assembling an OCI runtime configuration and driving an
//! external low-level runtime (`crun`/`runc`) together with its conmon
//! logging helper.
//!
//! ## What lives where
//!
//! - [`launcher`] — launch options, ID-mapping computation, spec assembly
//!   and process finalization.
//! - [`filesystem`] — bind parsing, the ordered mount planner, overlay
//!   stacking and FUSE-backed image mounts.
//! - [`cdi`] — Container Device Interface registry and spec injection.
//! - [`bundle`] — bundle locking and the lifecycle supervisor around the
//!   external runtime and conmon.
//!
//! The launcher never creates namespaces or cgroups itself; it only
//! configures the runtime that does.

#![warn(missing_docs)]

pub mod bundle;
pub mod cdi;
pub mod cli;
pub mod filesystem;
pub mod launcher;

pub use launcher::{LaunchOptions, Launcher};
