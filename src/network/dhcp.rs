//! Single-lease DHCP responder.
//!
//! The guest's link has exactly one assignable address, so this is not a
//! general DHCP server: there is no pool, no per-client state and no
//! collision detection. Discover always gets the same Offer; Request gets
//! an Ack for any well-formed non-zero address (see [`Responder::handle`]
//! for the deliberately permissive acknowledgment) and a Nak otherwise.
//!
//! Only the RFC 2131 fixed header plus the handful of options tapvm
//! interprets are implemented; malformed packets are dropped silently.

use crate::error::{Error, Result};
use crate::network::Subnet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const SERVER_PORT: u16 = 67;
const CLIENT_PORT: u16 = 68;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

/// RFC 2131 magic cookie separating the fixed header from the options.
const MAGIC: [u8; 4] = [99, 130, 83, 99];

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

/// DHCP message types (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Discover),
            2 => Some(Self::Offer),
            3 => Some(Self::Request),
            4 => Some(Self::Decline),
            5 => Some(Self::Ack),
            6 => Some(Self::Nak),
            7 => Some(Self::Release),
            8 => Some(Self::Inform),
            _ => None,
        }
    }
}

/// The single lease this responder hands to the guest.
#[derive(Debug, Clone)]
pub struct Lease {
    server: Ipv4Addr,
    guest: Ipv4Addr,
    mask: Ipv4Addr,
    duration: Duration,
    dns: Ipv4Addr,
}

impl Lease {
    /// Build the lease for a subnet: the guest gets `server + 1`.
    ///
    /// Fails if the guest address falls outside the subnet (the subnet is
    /// too small to hold both ends of the link).
    pub fn new(server: Ipv4Addr, subnet: Subnet, duration: Duration, dns: Ipv4Addr) -> Result<Self> {
        let guest = Ipv4Addr::from(u32::from(server).wrapping_add(1));
        if !subnet.contains(guest) {
            return Err(Error::config(format!(
                "guest address {} falls outside subnet {}",
                guest, subnet
            )));
        }

        Ok(Self {
            server,
            guest,
            mask: subnet.mask(),
            duration,
            dns,
        })
    }

    /// Server-side (lease authority) address.
    pub fn server(&self) -> Ipv4Addr {
        self.server
    }

    /// Address offered to the guest.
    pub fn guest(&self) -> Ipv4Addr {
        self.guest
    }
}

/// A parsed DHCP message (the subset tapvm interprets).
#[derive(Debug, Clone)]
pub struct Message {
    op: u8,
    xid: u32,
    flags: u16,
    ciaddr: Ipv4Addr,
    chaddr: [u8; 16],
    options: Vec<(u8, Vec<u8>)>,
}

impl Message {
    /// Parse a packet; `None` for anything too short or cookie-less.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 240 || buf[236..240] != MAGIC {
            return None;
        }

        let mut options = Vec::new();
        let mut i = 240;
        while i < buf.len() {
            match buf[i] {
                OPT_END => break,
                OPT_PAD => {
                    i += 1;
                }
                code => {
                    if i + 1 >= buf.len() {
                        break;
                    }
                    let len = buf[i + 1] as usize;
                    if i + 2 + len > buf.len() {
                        break;
                    }
                    options.push((code, buf[i + 2..i + 2 + len].to_vec()));
                    i += 2 + len;
                }
            }
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&buf[28..44]);

        Some(Self {
            op: buf[0],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            chaddr,
            options,
        })
    }

    fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    fn ipv4_option(&self, code: u8) -> Option<Ipv4Addr> {
        match self.option(code) {
            Some([a, b, c, d]) => Some(Ipv4Addr::new(*a, *b, *c, *d)),
            _ => None,
        }
    }

    fn message_type(&self) -> Option<MessageType> {
        match self.option(OPT_MESSAGE_TYPE) {
            Some([raw, ..]) => MessageType::from_u8(*raw),
            _ => None,
        }
    }
}

/// Answers Discover and Request with the one configured lease.
///
/// A pure request→response function over parsed messages: it reads only
/// the fixed lease, so concurrent requests need no synchronization.
#[derive(Debug, Clone)]
pub struct Responder {
    lease: Lease,
}

impl Responder {
    pub fn new(lease: Lease) -> Self {
        Self { lease }
    }

    /// Produce the reply bytes for a message, or `None` for messages this
    /// responder does not answer.
    pub fn handle(&self, msg: &Message) -> Option<Vec<u8>> {
        if msg.op != BOOTREQUEST {
            return None;
        }

        match msg.message_type()? {
            MessageType::Discover => {
                debug!(guest = %self.lease.guest, "offering lease");
                Some(self.reply(msg, MessageType::Offer, Some(self.lease.guest), true))
            }

            MessageType::Request => {
                if let Some(server) = msg.ipv4_option(OPT_SERVER_ID) {
                    if server != self.lease.server {
                        // Addressed to a different lease authority.
                        return None;
                    }
                }

                // Explicit requested-address option, falling back to the
                // client's current address. An option with a bogus length
                // is not a well-formed address and gets no fallback.
                let requested = match msg.option(OPT_REQUESTED_IP) {
                    Some(_) => msg.ipv4_option(OPT_REQUESTED_IP),
                    None => Some(msg.ciaddr),
                };

                match requested {
                    // Any well-formed non-zero address is acknowledged,
                    // even outside the configured subnet.
                    Some(ip) if !ip.is_unspecified() => {
                        debug!(requested = %ip, "acknowledging lease");
                        Some(self.reply(msg, MessageType::Ack, Some(ip), true))
                    }
                    _ => {
                        debug!("rejecting malformed address request");
                        Some(self.reply(msg, MessageType::Nak, None, false))
                    }
                }
            }

            _ => None,
        }
    }

    /// Build a BOOTREPLY for `req`.
    fn reply(
        &self,
        req: &Message,
        kind: MessageType,
        yiaddr: Option<Ipv4Addr>,
        with_lease: bool,
    ) -> Vec<u8> {
        let mut pkt = vec![0u8; 236];
        pkt[0] = BOOTREPLY;
        pkt[1] = 1; // Ethernet
        pkt[2] = 6; // MAC length
        pkt[4..8].copy_from_slice(&req.xid.to_be_bytes());
        pkt[10..12].copy_from_slice(&req.flags.to_be_bytes());
        if let Some(ip) = yiaddr {
            pkt[16..20].copy_from_slice(&ip.octets());
        }
        pkt[20..24].copy_from_slice(&self.lease.server.octets());
        pkt[28..44].copy_from_slice(&req.chaddr);

        pkt.extend_from_slice(&MAGIC);
        pkt.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, kind as u8]);
        pkt.extend_from_slice(&[OPT_SERVER_ID, 4]);
        pkt.extend_from_slice(&self.lease.server.octets());

        // A Nak still carries the lease-time option, zeroed.
        let secs = if with_lease {
            u32::try_from(self.lease.duration.as_secs()).unwrap_or(u32::MAX)
        } else {
            0
        };
        pkt.extend_from_slice(&[OPT_LEASE_TIME, 4]);
        pkt.extend_from_slice(&secs.to_be_bytes());

        if with_lease {
            pkt.extend_from_slice(&[OPT_SUBNET_MASK, 4]);
            pkt.extend_from_slice(&self.lease.mask.octets());
            pkt.extend_from_slice(&[OPT_ROUTER, 4]);
            pkt.extend_from_slice(&self.lease.server.octets());
            pkt.extend_from_slice(&[OPT_DNS, 4]);
            pkt.extend_from_slice(&self.lease.dns.octets());
        }

        pkt.push(OPT_END);
        pkt
    }
}

/// Bind the responder socket, pinned to the given interface.
pub fn bind(iface: &str) -> Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", SERVER_PORT))
        .map_err(|e| Error::interface(format!("failed to bind dhcp port: {}", e)))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::interface(format!("failed to enable broadcast: {}", e)))?;
    bind_to_device(&socket, iface)?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::interface(e.to_string()))?;

    UdpSocket::from_std(socket).map_err(|e| Error::interface(e.to_string()))
}

/// Pin a socket to one interface so the responder only ever hears the
/// guest, even though it binds the wildcard address.
fn bind_to_device(socket: &std::net::UdpSocket, iface: &str) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            iface.as_ptr() as *const libc::c_void,
            iface.len() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(Error::interface(format!(
            "failed to bind responder to {}: {}",
            iface,
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Serve requests until the socket dies.
///
/// There is no stop signal: deleting the interface invalidates the socket
/// and ends the task. Replies go to the client's address when it has one
/// and to the broadcast address otherwise.
pub async fn serve(socket: UdpSocket, responder: Responder) {
    info!(guest = %responder.lease.guest, "dhcp responder listening");

    let mut buf = [0u8; 1500];
    loop {
        let n = match socket.recv_from(&mut buf).await {
            Ok((n, _)) => n,
            Err(e) => {
                debug!(error = %e, "dhcp socket gone, responder exiting");
                return;
            }
        };

        let Some(msg) = Message::parse(&buf[..n]) else {
            continue;
        };
        let Some(reply) = responder.handle(&msg) else {
            continue;
        };

        let dest: SocketAddr = if msg.ciaddr.is_unspecified() {
            SocketAddrV4::new(Ipv4Addr::BROADCAST, CLIENT_PORT).into()
        } else {
            SocketAddrV4::new(msg.ciaddr, CLIENT_PORT).into()
        };

        if let Err(e) = socket.send_to(&reply, dest).await {
            warn!(error = %e, "failed to send dhcp reply");
        }
    }
}
