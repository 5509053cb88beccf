//! VM configuration.
//!
//! tapvm is driven by a single TOML document selected with `-c`. The
//! document names the guest's memory, display, network interfaces and
//! disks; each section later renders itself into qemu arguments (see
//! [`crate::qemu`]).

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default path of the qemu system emulator.
const DEFAULT_QEMU_BINARY: &str = "/usr/bin/qemu-system-x86_64";

/// Default path of the QMP control socket.
const DEFAULT_QMP_SOCKET: &str = "/run/tapvm-qmp.sock";

/// Default tap device name for the guest link.
const DEFAULT_TAP_NAME: &str = "tap0";

/// Default lease duration handed to the guest.
const DEFAULT_LEASE: Duration = Duration::from_secs(2 * 60 * 60);

/// Default DNS resolver offered to the guest.
const DEFAULT_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Top-level VM configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    /// Guest memory size, passed straight through to `-m` (e.g. "2G").
    pub memory: String,

    /// Path of the qemu binary to launch.
    #[serde(default = "default_qemu_binary")]
    pub qemu_binary: PathBuf,

    /// Path of the QMP control socket qemu will listen on.
    #[serde(default = "default_qmp_socket")]
    pub qmp_socket: PathBuf,

    /// Guest network: one tap device plus a single-lease DHCP responder.
    pub network: NetworkConfig,

    /// Spice display, if any.
    #[serde(default)]
    pub spice: Option<SpiceConfig>,

    /// Guest network interfaces.
    #[serde(default, rename = "iface")]
    pub ifaces: Vec<IfaceConfig>,

    /// Guest disks.
    #[serde(default, rename = "disk")]
    pub disks: Vec<DiskConfig>,
}

impl VmConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| Error::ConfigLoad(e.to_string()))
    }
}

/// Guest network configuration.
///
/// The tap side of the link gets network + 1, the guest is offered
/// network + 2; both must fit inside `subnet`.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Subnet in CIDR notation (e.g. "10.0.0.0/30").
    pub subnet: String,

    /// Tap device name.
    #[serde(default = "default_tap_name")]
    pub tap: String,

    /// Lease duration in humantime syntax (e.g. "2h").
    #[serde(default = "default_lease", deserialize_with = "de_duration")]
    pub lease: Duration,

    /// DNS resolver offered to the guest.
    #[serde(default = "default_dns")]
    pub dns: Ipv4Addr,
}

/// Spice display configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SpiceConfig {
    /// Port the spice server listens on.
    pub port: u16,
}

/// A guest network interface.
#[derive(Debug, Clone, Deserialize)]
pub struct IfaceConfig {
    /// NIC model (e.g. "virtio", "e1000").
    pub model: String,
}

/// A guest disk.
#[derive(Debug, Clone, Deserialize)]
pub struct DiskConfig {
    /// Path of the disk image on the host.
    pub image: PathBuf,

    /// Image format (e.g. "qcow2", "raw").
    pub format: String,

    /// Bus the disk is attached to (e.g. "virtio", "ide").
    pub model: String,
}

fn default_qemu_binary() -> PathBuf {
    PathBuf::from(DEFAULT_QEMU_BINARY)
}

fn default_qmp_socket() -> PathBuf {
    PathBuf::from(DEFAULT_QMP_SOCKET)
}

fn default_tap_name() -> String {
    DEFAULT_TAP_NAME.to_string()
}

fn default_lease() -> Duration {
    DEFAULT_LEASE
}

fn default_dns() -> Ipv4Addr {
    DEFAULT_DNS
}

/// Deserialize a humantime duration string ("90s", "2h", ...).
fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
        memory = "2G"
        qemu_binary = "/opt/qemu/bin/qemu-system-x86_64"
        qmp_socket = "/tmp/test-qmp.sock"

        [network]
        subnet = "10.0.0.0/30"
        tap = "tap1"
        lease = "90m"
        dns = "1.1.1.1"

        [spice]
        port = 5930

        [[iface]]
        model = "virtio"

        [[disk]]
        image = "/var/lib/vm/root.img"
        format = "qcow2"
        model = "virtio"
    "#;

    #[test]
    fn test_full_document_parses() {
        let config: VmConfig = toml::from_str(FULL).unwrap();

        assert_eq!(config.memory, "2G");
        assert_eq!(
            config.qemu_binary,
            PathBuf::from("/opt/qemu/bin/qemu-system-x86_64")
        );
        assert_eq!(config.network.subnet, "10.0.0.0/30");
        assert_eq!(config.network.tap, "tap1");
        assert_eq!(config.network.lease, Duration::from_secs(90 * 60));
        assert_eq!(config.network.dns, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(config.spice.unwrap().port, 5930);
        assert_eq!(config.ifaces.len(), 1);
        assert_eq!(config.disks.len(), 1);
    }

    #[test]
    fn test_defaults_apply_when_keys_omitted() {
        let minimal = r#"
            memory = "512M"

            [network]
            subnet = "192.168.7.0/24"
        "#;

        let config: VmConfig = toml::from_str(minimal).unwrap();

        assert_eq!(config.qemu_binary, PathBuf::from(DEFAULT_QEMU_BINARY));
        assert_eq!(config.qmp_socket, PathBuf::from(DEFAULT_QMP_SOCKET));
        assert_eq!(config.network.tap, "tap0");
        assert_eq!(config.network.lease, Duration::from_secs(7200));
        assert_eq!(config.network.dns, Ipv4Addr::new(8, 8, 8, 8));
        assert!(config.spice.is_none());
        assert!(config.ifaces.is_empty());
        assert!(config.disks.is_empty());
    }

    #[test]
    fn test_malformed_lease_is_rejected() {
        let bad = r#"
            memory = "512M"

            [network]
            subnet = "192.168.7.0/24"
            lease = "soon"
        "#;

        assert!(toml::from_str::<VmConfig>(bad).is_err());
    }

    #[test]
    fn test_load_reports_missing_file() {
        let err = VmConfig::load(Path::new("/nonexistent/tapvm.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
        assert!(err.to_string().contains("/nonexistent/tapvm.toml"));
    }

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();

        let config = VmConfig::load(file.path()).unwrap();
        assert_eq!(config.memory, "2G");
    }
}
