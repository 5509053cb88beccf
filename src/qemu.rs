//! QEMU launch and exit classification.
//!
//! Builds the argument list from the configuration, spawns qemu in its
//! own process group, and classifies the wait status once the child is
//! reaped. Reaping is SIGCHLD-driven: the supervisor's event loop calls
//! [`reap`] once per notification.

use crate::config::{DiskConfig, IfaceConfig, SpiceConfig, VmConfig};
use crate::error::{Error, Result};
use std::fmt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

impl SpiceConfig {
    /// Render this section as qemu arguments.
    pub fn build_args(&self) -> Vec<String> {
        vec![
            "-vga".to_string(),
            "qxl".to_string(),
            "-spice".to_string(),
            format!("port={},disable-ticketing", self.port),
        ]
    }
}

impl IfaceConfig {
    /// Render this section as qemu arguments, attached to the given tap.
    pub fn build_args(&self, tap: &str) -> Vec<String> {
        vec![
            "-net".to_string(),
            format!("nic,model={}", self.model),
            "-net".to_string(),
            format!("tap,ifname={},script=no,downscript=no,vhost=on", tap),
        ]
    }
}

impl DiskConfig {
    /// Render this section as qemu arguments.
    pub fn build_args(&self) -> Vec<String> {
        vec![
            "-drive".to_string(),
            format!(
                "format={},file={},cache=writeback,if={}",
                self.format,
                self.image.display(),
                self.model
            ),
        ]
    }
}

/// Build the full qemu argument list for a configuration.
///
/// Fixed base first, then spice, interfaces and disks in configuration
/// order.
pub fn build_args(config: &VmConfig) -> Vec<String> {
    let mut args = vec![
        "--enable-kvm".to_string(),
        "-m".to_string(),
        config.memory.clone(),
        "-boot".to_string(),
        "order=d".to_string(),
        "-monitor".to_string(),
        "none".to_string(),
        "-qmp".to_string(),
        format!("unix:{},server,nowait", config.qmp_socket.display()),
    ];

    if let Some(spice) = &config.spice {
        args.extend(spice.build_args());
    }

    for iface in &config.ifaces {
        args.extend(iface.build_args(&config.network.tap));
    }

    for disk in &config.disks {
        args.extend(disk.build_args());
    }

    args
}

/// Handle to the running qemu child process.
#[derive(Debug, Clone, Copy)]
pub struct VmProcess {
    pid: libc::pid_t,
    started_at: Instant,
}

impl VmProcess {
    /// Process id of the qemu child.
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Time since the child was spawned.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Spawn qemu with the arguments built from `config`.
///
/// The child gets its own process group so terminal-delivered signals
/// reach only the supervisor, which decides how to forward them.
pub fn launch(config: &VmConfig) -> Result<VmProcess> {
    let args = build_args(config);

    tracing::info!(
        binary = %config.qemu_binary.display(),
        args = %args.join(" "),
        "starting qemu"
    );

    let child = Command::new(&config.qemu_binary)
        .args(&args)
        .stdin(Stdio::null())
        .process_group(0)
        .spawn()
        .map_err(|e| Error::launch(format!("{}: {}", config.qemu_binary.display(), e)))?;

    Ok(VmProcess {
        pid: child.id() as libc::pid_t,
        started_at: Instant::now(),
    })
}

/// Terminal state of the reaped qemu process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmExit {
    kind: ExitKind,
    core_dumped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitKind {
    Exited(i32),
    Signaled(i32),
}

impl VmExit {
    /// Exit code propagated to the host: the child's own status for a
    /// clean exit, -1 for a signal death.
    pub fn code(&self) -> i32 {
        match self.kind {
            ExitKind::Exited(code) => code,
            ExitKind::Signaled(_) => -1,
        }
    }
}

impl fmt::Display for VmExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ExitKind::Exited(code) => write!(f, "exit status {}", code)?,
            ExitKind::Signaled(signo) => write!(f, "signal: {}", signal_name(signo))?,
        }
        if self.core_dumped {
            write!(f, " (core dumped)")?;
        }
        Ok(())
    }
}

/// Reap a terminated child, if there is one.
///
/// Non-blocking; returns `Ok(None)` when the SIGCHLD was not for a
/// terminated child (a stopped child, say). Call once per notification.
pub fn reap() -> Result<Option<VmExit>> {
    let mut status: libc::c_int = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };

    if pid < 0 {
        return Err(Error::Reap(std::io::Error::last_os_error()));
    }
    if pid == 0 {
        return Ok(None);
    }

    Ok(classify(status))
}

/// Classify a raw wait status.
fn classify(status: libc::c_int) -> Option<VmExit> {
    let kind = if libc::WIFEXITED(status) {
        ExitKind::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitKind::Signaled(libc::WTERMSIG(status))
    } else {
        return None;
    };

    Some(VmExit {
        kind,
        core_dumped: libc::WCOREDUMP(status),
    })
}

/// Human name of a termination signal, as the shell would report it.
fn signal_name(signo: i32) -> String {
    let name = match signo {
        libc::SIGHUP => "hangup",
        libc::SIGINT => "interrupt",
        libc::SIGQUIT => "quit",
        libc::SIGILL => "illegal instruction",
        libc::SIGTRAP => "trace/breakpoint trap",
        libc::SIGABRT => "aborted",
        libc::SIGBUS => "bus error",
        libc::SIGFPE => "floating point exception",
        libc::SIGKILL => "killed",
        libc::SIGSEGV => "segmentation fault",
        libc::SIGPIPE => "broken pipe",
        libc::SIGALRM => "alarm clock",
        libc::SIGTERM => "terminated",
        _ => return format!("signal {}", signo),
    };
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config() -> VmConfig {
        VmConfig {
            memory: "2G".to_string(),
            qemu_binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            qmp_socket: PathBuf::from("/run/tapvm-qmp.sock"),
            network: crate::config::NetworkConfig {
                subnet: "10.0.0.0/30".to_string(),
                tap: "tap0".to_string(),
                lease: Duration::from_secs(7200),
                dns: Ipv4Addr::new(8, 8, 8, 8),
            },
            spice: Some(SpiceConfig { port: 5930 }),
            ifaces: vec![IfaceConfig {
                model: "virtio".to_string(),
            }],
            disks: vec![DiskConfig {
                image: PathBuf::from("/var/lib/vm/root.img"),
                format: "qcow2".to_string(),
                model: "virtio".to_string(),
            }],
        }
    }

    #[test]
    fn test_build_args_full_config() {
        let args = build_args(&test_config());

        let expected: Vec<String> = [
            "--enable-kvm",
            "-m",
            "2G",
            "-boot",
            "order=d",
            "-monitor",
            "none",
            "-qmp",
            "unix:/run/tapvm-qmp.sock,server,nowait",
            "-vga",
            "qxl",
            "-spice",
            "port=5930,disable-ticketing",
            "-net",
            "nic,model=virtio",
            "-net",
            "tap,ifname=tap0,script=no,downscript=no,vhost=on",
            "-drive",
            "format=qcow2,file=/var/lib/vm/root.img,cache=writeback,if=virtio",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(args, expected);
    }

    #[test]
    fn test_build_args_without_optional_sections() {
        let mut config = test_config();
        config.spice = None;
        config.ifaces.clear();
        config.disks.clear();

        let args = build_args(&config);
        assert_eq!(args.len(), 10);
        assert!(!args.iter().any(|a| a.contains("spice")));
    }

    // Wait statuses below use the Linux encoding: a clean exit carries
    // the code in bits 8..16, a signal death carries the signal number in
    // the low 7 bits, and 0x80 flags a core dump.

    #[test]
    fn test_classify_clean_exit() {
        let exit = classify(137 << 8).unwrap();
        assert_eq!(exit.code(), 137);
        assert_eq!(exit.to_string(), "exit status 137");
    }

    #[test]
    fn test_classify_zero_exit() {
        let exit = classify(0).unwrap();
        assert_eq!(exit.code(), 0);
        assert_eq!(exit.to_string(), "exit status 0");
    }

    #[test]
    fn test_classify_signal_death() {
        let exit = classify(libc::SIGKILL).unwrap();
        assert_eq!(exit.code(), -1);
        assert_eq!(exit.to_string(), "signal: killed");
    }

    #[test]
    fn test_classify_core_dump_marker() {
        let exit = classify(libc::SIGSEGV | 0x80).unwrap();
        assert_eq!(exit.code(), -1);
        assert_eq!(exit.to_string(), "signal: segmentation fault (core dumped)");
    }

    #[test]
    fn test_classify_unknown_signal_falls_back_to_number() {
        let exit = classify(35).unwrap();
        assert_eq!(exit.to_string(), "signal: signal 35");
    }
}
