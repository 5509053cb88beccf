//! Guest network provisioning.
//!
//! The guest sees exactly one point-to-point link: a host tap device
//! carrying the server-side address, with a single-lease DHCP responder
//! ([`dhcp`]) answering on it. This module owns the address arithmetic
//! (server = network + 1, guest = network + 2) and the tap lifecycle.

pub mod dhcp;
pub mod tap;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tracing::{info, warn};

use tap::LinkOps;

/// An IPv4 subnet in CIDR notation, normalized to its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// The netmask as an address (e.g. 255.255.255.252 for /30).
    pub fn mask(&self) -> Ipv4Addr {
        let bits = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        };
        Ipv4Addr::from(bits)
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `addr` lies inside this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.mask()) == u32::from(self.network)
    }

    /// The host at `network + offset`, if it lies inside the subnet.
    pub fn host(&self, offset: u32) -> Option<Ipv4Addr> {
        let addr = Ipv4Addr::from(u32::from(self.network).checked_add(offset)?);
        self.contains(addr).then_some(addr)
    }
}

impl FromStr for Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::config(format!("malformed subnet {:?}: expected CIDR", s)))?;

        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::config(format!("malformed subnet {:?}: bad address", s)))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| Error::config(format!("malformed subnet {:?}: bad prefix", s)))?;

        let mask = Subnet {
            network: Ipv4Addr::UNSPECIFIED,
            prefix,
        }
        .mask();

        Ok(Subnet {
            network: Ipv4Addr::from(u32::from(addr) & u32::from(mask)),
            prefix,
        })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// The provisioned guest network: one tap device plus its lease.
///
/// Held by the supervisor for the lifetime of the VM and torn down
/// exactly once on the terminal shutdown path.
#[derive(Debug)]
pub struct TapNetwork {
    name: String,
    lease: dhcp::Lease,
}

impl TapNetwork {
    /// Tap device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lease the responder hands to the guest.
    pub fn lease(&self) -> &dhcp::Lease {
        &self.lease
    }

    /// Spawn the DHCP responder as a background task bound to this
    /// interface.
    ///
    /// The task has no stop signal; it ends on its own once the interface
    /// is deleted and its socket dies.
    pub fn start_responder(&self) -> Result<()> {
        let socket = dhcp::bind(&self.name)?;
        tokio::spawn(dhcp::serve(socket, dhcp::Responder::new(self.lease.clone())));
        Ok(())
    }

    /// Delete the tap device.
    ///
    /// Failure is logged, never escalated: this runs on the exit path and
    /// must not mask the VM's real exit code.
    pub fn teardown(&self, link: &impl LinkOps) {
        if let Err(e) = link.delete(&self.name) {
            warn!(tap = %self.name, error = %e, "failed to delete tap device");
        }
    }
}

/// Create and configure the guest tap device.
///
/// Parses the subnet, derives the server and guest addresses, creates the
/// tap, assigns the server address and brings the link up. If address
/// assignment or link-up fails the half-configured device is deleted
/// best-effort before the error is returned, so it is never silently
/// leaked.
pub fn provision(config: &NetworkConfig, link: &impl LinkOps) -> Result<TapNetwork> {
    let subnet: Subnet = config.subnet.parse()?;
    let server = subnet.host(1).ok_or_else(|| {
        Error::config(format!("subnet {} has no usable host address", subnet))
    })?;
    let lease = dhcp::Lease::new(server, subnet, config.lease, config.dns)?;

    info!(
        tap = %config.tap,
        server = %server,
        guest = %lease.guest(),
        "creating tap device"
    );

    link.create_tap(&config.tap)?;

    let configured = link
        .assign_address(&config.tap, server, subnet.prefix())
        .and_then(|_| link.set_up(&config.tap));

    if let Err(e) = configured {
        if let Err(del) = link.delete(&config.tap) {
            warn!(tap = %config.tap, error = %del, "failed to delete half-configured tap");
        }
        return Err(e);
    }

    Ok(TapNetwork {
        name: config.tap.clone(),
        lease,
    })
}
