//! Tap device operations.
//!
//! Everything goes through `ip(8)`, so tapvm needs no netlink bindings
//! and no capabilities beyond what the `ip` binary itself requires.

use crate::error::{Error, Result};
use std::net::Ipv4Addr;
use std::process::Command;

/// Kernel networking operations needed to provision one tap device.
///
/// Production code uses [`IpLink`]; tests substitute a recording fake so
/// provisioning logic runs without privileges.
pub trait LinkOps {
    /// Create a tap device with the given name.
    fn create_tap(&self, name: &str) -> Result<()>;

    /// Assign `addr/prefix` to the device.
    fn assign_address(&self, name: &str, addr: Ipv4Addr, prefix: u8) -> Result<()>;

    /// Bring the device administratively up.
    fn set_up(&self, name: &str) -> Result<()>;

    /// Delete the device.
    fn delete(&self, name: &str) -> Result<()>;
}

/// [`LinkOps`] implementation shelling out to `ip(8)`.
pub struct IpLink;

impl IpLink {
    fn run(args: &[&str]) -> Result<()> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| Error::interface(format!("failed to execute ip: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::interface(format!(
                "ip {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(())
    }
}

impl LinkOps for IpLink {
    fn create_tap(&self, name: &str) -> Result<()> {
        Self::run(&["tuntap", "add", "dev", name, "mode", "tap"])
    }

    fn assign_address(&self, name: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        Self::run(&["addr", "add", &format!("{}/{}", addr, prefix), "dev", name])
    }

    fn set_up(&self, name: &str) -> Result<()> {
        Self::run(&["link", "set", "dev", name, "up"])
    }

    fn delete(&self, name: &str) -> Result<()> {
        Self::run(&["link", "delete", "dev", name])
    }
}
