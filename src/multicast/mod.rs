pub mod avahi;

use {
    anyhow::{Context, Result},
    nix::sys::socket::{setsockopt, sockopt},
    socket2::{Domain, Protocol, Socket, Type},
    std::{
        ffi::OsString,
        net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket},
    },
};

pub const DEFAULT_RTP_PORT: u16 = 5004;
pub const DEFAULT_RTCP_PORT: u16 = 5005;
pub const DEFAULT_STAT_PORT: u16 = 5006;

/// Appends `.local` to bare service names.
pub fn ensure_local(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{name}.local")
    }
}

/// Hashes a group name into a deterministic administratively-scoped
/// IPv4 multicast address in 239.0.0.0/8.
pub fn synthesize_address(name: &str) -> Ipv4Addr {
    // FNV-1a over the name bytes
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    Ipv4Addr::from(0xef00_0000 | (hash & 0x00ff_ffff))
}

/// A resolved output group: either a DNS answer or a synthesized
/// address the advertiser must also publish an address record for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAddr {
    pub name: String,
    pub addr: SocketAddr,
    pub synthesized: bool,
}

/// Resolves a DNS-style group name (two attempts), falling back to a
/// synthesized address derived from the name.
pub fn resolve_group(name: &str, port: u16, use_dns: bool) -> GroupAddr {
    let name = ensure_local(name);
    if use_dns {
        for _ in 0..2 {
            if let Ok(mut addrs) = (name.as_str(), port).to_socket_addrs() {
                if let Some(addr) = addrs.next() {
                    return GroupAddr {
                        name,
                        addr,
                        synthesized: false,
                    };
                }
            }
        }
        log::warn!("cannot resolve {name}, synthesizing a group address");
    }
    let addr = SocketAddr::from((synthesize_address(&name), port));
    GroupAddr {
        name,
        addr,
        synthesized: true,
    }
}

/// Selects the outgoing interface, by address or by device name.
fn apply_iface(sock: &Socket, iface: &str) -> Result<()> {
    if let Ok(addr) = iface.parse::<Ipv4Addr>() {
        sock.set_multicast_if_v4(&addr)
            .with_context(|| format!("selecting interface {iface}"))?;
    } else {
        setsockopt(sock, sockopt::BindToDevice, &OsString::from(iface))
            .with_context(|| format!("binding to device {iface}"))?;
    }
    Ok(())
}

/// The two process-wide media send sockets. Sends are concurrency-safe
/// at the OS layer; nothing here takes a lock.
#[derive(Debug)]
pub struct OutputSockets {
    ttl: UdpSocket,
    ttl0: UdpSocket,
    configured_ttl: u8,
}

impl OutputSockets {
    /// Opens the TTL>0 socket (configured TTL, minimum 1) and the TTL=0
    /// loopback-only socket, both on the configured interface.
    pub fn open(iface: Option<&str>, ttl: u8, tos: u8) -> Result<OutputSockets> {
        let make = |socket_ttl: u32| -> Result<UdpSocket> {
            let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
                .context("creating send socket")?;
            sock.set_multicast_ttl_v4(socket_ttl)
                .context("IP_MULTICAST_TTL")?;
            sock.set_multicast_loop_v4(true)
                .context("IP_MULTICAST_LOOP")?;
            setsockopt(&sock, sockopt::IpTos, &i32::from(tos)).context("IP_TOS")?;
            if let Some(name) = iface {
                apply_iface(&sock, name)?;
            }
            sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
                .context("binding send socket")?;
            Ok(sock.into())
        };

        Ok(OutputSockets {
            ttl: make(u32::from(ttl.max(1)))?,
            ttl0: make(0)?,
            configured_ttl: ttl,
        })
    }

    #[inline]
    pub fn routed(&self) -> &UdpSocket {
        &self.ttl
    }

    #[inline]
    pub fn local(&self) -> &UdpSocket {
        &self.ttl0
    }

    #[inline]
    pub fn configured_ttl(&self) -> u8 {
        self.configured_ttl
    }

    /// Picks the socket a channel's TTL calls for.
    #[inline]
    pub fn sender(&self, ttl: u8) -> &UdpSocket {
        if ttl == 0 {
            &self.ttl0
        } else {
            &self.ttl
        }
    }

    /// Group-joins on the send socket keep snooping switches forwarding
    /// the group even with no other local listener.
    pub fn join(&self, group: Ipv4Addr) -> Result<()> {
        self.ttl
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .with_context(|| format!("joining group {group}"))
    }
}

/// Opens a dedicated receive socket bound to a multicast group.
pub fn open_receive(group: SocketAddrV4, iface: Option<&str>) -> Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating receive socket")?;
    sock.set_reuse_address(true).context("SO_REUSEADDR")?;
    sock.bind(&(group).into())
        .with_context(|| format!("binding to {group}"))?;
    let iface_addr = iface
        .and_then(|name| name.parse().ok())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    sock.join_multicast_v4(group.ip(), &iface_addr)
        .with_context(|| format!("joining group {}", group.ip()))?;
    Ok(sock.into())
}
