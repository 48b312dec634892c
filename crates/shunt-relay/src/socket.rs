use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket as StdUdpSocket};

use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::net::UdpSocket;

use crate::RelayConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];
}

/// IPv4 addressing of an interface: address, broadcast address, netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceIpv4 {
    pub addr: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Creates the sockets a multicast forwarder needs.
///
/// Injected so the relay engines can be exercised against loopback sockets;
/// the production implementation is [`NetSocketFactory`].
pub trait SocketFactory {
    /// Binds a listener for `config`'s multicast group and port on `ifname`.
    fn bind_multicast(
        &self,
        family: IpFamily,
        ifname: &str,
        config: &RelayConfig,
    ) -> io::Result<UdpSocket>;

    /// Binds a short-lived sender on `ifname` whose source port is
    /// `src_port`, so relayed queries elicit replies to the right port.
    fn bind_mcast_sender(
        &self,
        family: IpFamily,
        ifname: &str,
        src_port: u16,
    ) -> io::Result<StdUdpSocket>;
}

/// Creates the sockets a broadcast forwarder needs.
pub trait BcastSocketFactory {
    /// Binds a raw listener seeing every UDP frame on `ifname`, IP header
    /// included, so broadcasts to any port are observed.
    fn bind_broadcast_listener(&self, ifname: &str) -> io::Result<AsyncFd<Socket>>;

    /// Binds a broadcast-capable sender on `ifname` with source port
    /// `src_port` (0 for ephemeral).
    fn bind_broadcast_sender(&self, ifname: &str, src_port: u16) -> io::Result<StdUdpSocket>;

    /// The current IPv4 address triple of `ifname`.
    fn interface_ipv4(&self, ifname: &str) -> io::Result<InterfaceIpv4>;
}

/// Production socket factory backed by the kernel's network stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetSocketFactory;

impl SocketFactory for NetSocketFactory {
    fn bind_multicast(
        &self,
        family: IpFamily,
        ifname: &str,
        config: &RelayConfig,
    ) -> io::Result<UdpSocket> {
        let ifindex = if_index(ifname)?;
        let socket = match family {
            IpFamily::V4 => {
                let socket = new_udp_socket(Domain::IPV4, ifname)?;
                socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port).into())?;
                socket.join_multicast_v4_n(
                    &config.mcast_addr4,
                    &InterfaceIndexOrAddress::Index(ifindex),
                )?;
                if let Ok(iface) = interface_ipv4_of(ifname) {
                    socket.set_multicast_if_v4(&iface.addr)?;
                }
                socket.set_multicast_loop_v4(false)?;
                socket
            }
            IpFamily::V6 => {
                let socket = new_udp_socket(Domain::IPV6, ifname)?;
                socket.set_only_v6(true)?;
                socket.bind(
                    &SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, config.port, 0, 0).into(),
                )?;
                socket.join_multicast_v6(&config.mcast_addr6, ifindex)?;
                socket.set_multicast_if_v6(ifindex)?;
                socket.set_multicast_loop_v6(false)?;
                socket
            }
        };
        UdpSocket::from_std(socket.into())
    }

    fn bind_mcast_sender(
        &self,
        family: IpFamily,
        ifname: &str,
        src_port: u16,
    ) -> io::Result<StdUdpSocket> {
        let socket = match family {
            IpFamily::V4 => {
                let socket = new_sender_socket(Domain::IPV4, ifname)?;
                socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, src_port).into())?;
                if let Ok(iface) = interface_ipv4_of(ifname) {
                    socket.set_multicast_if_v4(&iface.addr)?;
                }
                socket
            }
            IpFamily::V6 => {
                let socket = new_sender_socket(Domain::IPV6, ifname)?;
                socket.set_only_v6(true)?;
                socket.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, src_port, 0, 0).into())?;
                socket.set_multicast_if_v6(if_index(ifname)?)?;
                socket
            }
        };
        Ok(socket.into())
    }
}

impl BcastSocketFactory for NetSocketFactory {
    fn bind_broadcast_listener(&self, ifname: &str) -> io::Result<AsyncFd<Socket>> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind_device(Some(ifname.as_bytes()))?;
        AsyncFd::new(socket)
    }

    fn bind_broadcast_sender(&self, ifname: &str, src_port: u16) -> io::Result<StdUdpSocket> {
        let socket = new_sender_socket(Domain::IPV4, ifname)?;
        socket.set_broadcast(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, src_port).into())?;
        Ok(socket.into())
    }

    fn interface_ipv4(&self, ifname: &str) -> io::Result<InterfaceIpv4> {
        interface_ipv4_of(ifname)
    }
}

fn new_udp_socket(domain: Domain, ifname: &str) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind_device(Some(ifname.as_bytes()))?;
    Ok(socket)
}

fn new_sender_socket(domain: Domain, ifname: &str) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind_device(Some(ifname.as_bytes()))?;
    Ok(socket)
}

fn if_index(ifname: &str) -> io::Result<u32> {
    nix::net::if_::if_nametoindex(ifname).map_err(io::Error::from)
}

fn interface_ipv4_of(ifname: &str) -> io::Result<InterfaceIpv4> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(io::Error::from)?;
    for entry in addrs {
        if entry.interface_name != ifname {
            continue;
        }
        let Some(addr) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in()).map(|a| a.ip())
        else {
            continue;
        };
        let netmask = entry
            .netmask
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|a| a.ip())
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let broadcast = entry
            .broadcast
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|a| a.ip())
            .unwrap_or(Ipv4Addr::BROADCAST);
        return Ok(InterfaceIpv4 {
            addr,
            broadcast,
            netmask,
        });
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no IPv4 address on {ifname}"),
    ))
}

/// The multicast destination for one family of a relay config.
pub(crate) fn mcast_dst(config: &RelayConfig, family: IpFamily) -> SocketAddr {
    match family {
        IpFamily::V4 => SocketAddr::V4(SocketAddrV4::new(config.mcast_addr4, config.port)),
        IpFamily::V6 => SocketAddr::V6(SocketAddrV6::new(config.mcast_addr6, config.port, 0, 0)),
    }
}

/// Rate-limited socket error logging: the last errno seen on a socket is
/// remembered so repeated identical failures do not log once per packet.
pub(crate) fn note_socket_error(
    last_errno: &mut Option<i32>,
    what: &str,
    target: &str,
    err: &io::Error,
) {
    let errno = err.raw_os_error().unwrap_or(0);
    if *last_errno == Some(errno) {
        return;
    }
    *last_errno = Some(errno);
    tracing::warn!("failed to {what} on {target}: {err}");
}
