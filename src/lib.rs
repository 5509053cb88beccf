//! tapvm supervises a single QEMU microVM.
//!
//! A TOML document describes the guest; tapvm provisions an isolated tap
//! device with a single-lease DHCP responder, launches qemu in its own
//! process group with a QMP control socket, supervises the child across
//! graceful (QMP power-down) and forced shutdown, and exits with the
//! guest's classified exit code.

pub mod config;
pub mod error;
pub mod network;
pub mod qemu;
pub mod qmp;
pub mod supervisor;

pub use error::{Error, Result};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
