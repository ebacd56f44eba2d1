//! Shared utilities for the ibex launcher.
//!
//! This crate carries the pieces every other ibex crate needs: the common
//! error taxonomy and the filesystem layout helpers for bundle and state
//! directories.

pub mod error;
pub mod paths;

pub use error::{IbexError, IbexResult};
pub use paths::StatePaths;
