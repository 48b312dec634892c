use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::task::{Context, Poll};

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::counters::RelayCounters;
use crate::mdns::translate_mdns_ip;
use crate::socket::{mcast_dst, note_socket_error, IpFamily, NetSocketFactory, SocketFactory};
use crate::RelayConfig;

const RELAY_BUF_SIZE: usize = 4096;

/// Lifecycle commands delivered to a running forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwarderEvent {
    AddGuest(String),
    RemoveGuest(String),
    /// The physical interface's IPv4 address changed (`None` when lost).
    LanAddrChanged(Option<Ipv4Addr>),
}

struct RelaySocket {
    socket: UdpSocket,
    /// Last errno seen on this socket, kept to avoid per-packet log spam.
    last_errno: Option<i32>,
}

impl RelaySocket {
    fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            last_errno: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Lan(IpFamily),
    Guest(IpFamily, String),
}

enum Incoming {
    Datagram {
        origin: Origin,
        data: Vec<u8>,
        src: SocketAddr,
    },
    ReadError {
        origin: Origin,
        err: io::Error,
    },
}

/// Relays one multicast protocol between the physical interface and every
/// active guest interface.
///
/// One upstream socket per address family, one guest socket per (family,
/// interface). Guests come and go through [`ForwarderEvent`]s; the forwarder
/// itself only terminates when its event channel closes at daemon shutdown.
pub struct MulticastForwarder<F = NetSocketFactory> {
    config: RelayConfig,
    lan_ifname: String,
    lan_addr: Option<Ipv4Addr>,
    factory: F,
    lan_sockets: HashMap<IpFamily, RelaySocket>,
    guests: HashMap<(IpFamily, String), RelaySocket>,
    counters: RelayCounters,
    /// Errno memory for the short-lived upstream sender path.
    sender_errno: Option<i32>,
}

impl MulticastForwarder<NetSocketFactory> {
    pub fn new(config: RelayConfig, lan_ifname: impl Into<String>, counters: RelayCounters) -> Self {
        Self::with_factory(config, lan_ifname, NetSocketFactory, counters)
    }
}

impl<F: SocketFactory> MulticastForwarder<F> {
    pub fn with_factory(
        config: RelayConfig,
        lan_ifname: impl Into<String>,
        factory: F,
        counters: RelayCounters,
    ) -> Self {
        Self {
            config,
            lan_ifname: lan_ifname.into(),
            lan_addr: None,
            factory,
            lan_sockets: HashMap::new(),
            guests: HashMap::new(),
            counters,
            sender_errno: None,
        }
    }

    /// Binds the upstream multicast listeners on the physical interface.
    ///
    /// IPv4 is mandatory; a missing IPv6 stack only costs IPv6 relay.
    pub fn init(&mut self) -> io::Result<()> {
        let v4 = self
            .factory
            .bind_multicast(IpFamily::V4, &self.lan_ifname, &self.config)?;
        self.lan_sockets.insert(IpFamily::V4, RelaySocket::new(v4));

        match self
            .factory
            .bind_multicast(IpFamily::V6, &self.lan_ifname, &self.config)
        {
            Ok(v6) => {
                self.lan_sockets.insert(IpFamily::V6, RelaySocket::new(v6));
            }
            Err(err) => {
                warn!(
                    protocol = self.config.protocol.label(),
                    "no IPv6 multicast listener on {}: {err}", self.lan_ifname,
                );
            }
        }
        Ok(())
    }

    /// Starts relaying to and from `ifname`. Re-adding an interface that is
    /// already forwarded is a no-op; returns whether anything was added.
    pub fn add_guest(&mut self, ifname: &str) -> bool {
        if self.has_guest(ifname) {
            debug!(
                protocol = self.config.protocol.label(),
                "already forwarding to {ifname}",
            );
            return false;
        }

        let mut added = false;
        for family in IpFamily::ALL {
            match self.factory.bind_multicast(family, ifname, &self.config) {
                Ok(socket) => {
                    self.guests
                        .insert((family, ifname.to_string()), RelaySocket::new(socket));
                    added = true;
                }
                Err(err) => {
                    warn!(
                        protocol = self.config.protocol.label(),
                        "cannot bind {family:?} guest socket on {ifname}: {err}",
                    );
                }
            }
        }
        if added {
            info!(
                protocol = self.config.protocol.label(),
                "forwarding between {} and {ifname}", self.lan_ifname,
            );
        }
        added
    }

    /// Stops relaying to `ifname`; unknown interfaces are a no-op.
    pub fn remove_guest(&mut self, ifname: &str) {
        let before = self.guests.len();
        self.guests.retain(|(_, name), _| name != ifname);
        if self.guests.len() != before {
            info!(
                protocol = self.config.protocol.label(),
                "stopped forwarding to {ifname}",
            );
        }
    }

    pub fn has_guest(&self, ifname: &str) -> bool {
        self.guests.keys().any(|(_, name)| name == ifname)
    }

    /// Drives the forwarder until the event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<ForwarderEvent>) {
        info!(
            protocol = self.config.protocol.label(),
            lan = %self.lan_ifname,
            "multicast forwarder running",
        );
        loop {
            enum Step {
                Command(Option<ForwarderEvent>),
                Socket(Incoming),
            }

            let step = poll_fn(|cx| {
                if let Poll::Ready(cmd) = events.poll_recv(cx) {
                    return Poll::Ready(Step::Command(cmd));
                }
                self.poll_incoming(cx).map(Step::Socket)
            })
            .await;

            match step {
                Step::Command(None) => break,
                Step::Command(Some(event)) => self.handle_event(event),
                Step::Socket(incoming) => self.handle_incoming(incoming),
            }
        }
        info!(
            protocol = self.config.protocol.label(),
            "multicast forwarder stopped",
        );
    }

    fn handle_event(&mut self, event: ForwarderEvent) {
        match event {
            ForwarderEvent::AddGuest(ifname) => {
                self.add_guest(&ifname);
            }
            ForwarderEvent::RemoveGuest(ifname) => self.remove_guest(&ifname),
            ForwarderEvent::LanAddrChanged(addr) => self.lan_addr = addr,
        }
    }

    /// Polls every socket for one readable datagram. Registers interest on
    /// all pending sockets so any of them wakes the forwarder task.
    fn poll_incoming(&mut self, cx: &mut Context<'_>) -> Poll<Incoming> {
        let mut buf = [0u8; RELAY_BUF_SIZE];

        for (family, lan) in &self.lan_sockets {
            let mut read_buf = ReadBuf::new(&mut buf);
            match lan.socket.poll_recv_from(cx, &mut read_buf) {
                Poll::Ready(Ok(src)) => {
                    return Poll::Ready(Incoming::Datagram {
                        origin: Origin::Lan(*family),
                        data: read_buf.filled().to_vec(),
                        src,
                    });
                }
                Poll::Ready(Err(err)) => {
                    return Poll::Ready(Incoming::ReadError {
                        origin: Origin::Lan(*family),
                        err,
                    });
                }
                Poll::Pending => {}
            }
        }

        for ((family, ifname), guest) in &self.guests {
            let mut read_buf = ReadBuf::new(&mut buf);
            match guest.socket.poll_recv_from(cx, &mut read_buf) {
                Poll::Ready(Ok(src)) => {
                    return Poll::Ready(Incoming::Datagram {
                        origin: Origin::Guest(*family, ifname.clone()),
                        data: read_buf.filled().to_vec(),
                        src,
                    });
                }
                Poll::Ready(Err(err)) => {
                    return Poll::Ready(Incoming::ReadError {
                        origin: Origin::Guest(*family, ifname.clone()),
                        err,
                    });
                }
                Poll::Pending => {}
            }
        }

        Poll::Pending
    }

    fn handle_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::ReadError { origin, err } => {
                let last_errno = match &origin {
                    Origin::Lan(family) => {
                        self.lan_sockets.get_mut(family).map(|s| &mut s.last_errno)
                    }
                    Origin::Guest(family, ifname) => self
                        .guests
                        .get_mut(&(*family, ifname.clone()))
                        .map(|s| &mut s.last_errno),
                };
                if let Some(last_errno) = last_errno {
                    note_socket_error(last_errno, "receive", &format!("{origin:?}"), &err);
                }
            }
            Incoming::Datagram { origin, mut data, src } => match origin {
                Origin::Lan(family) => {
                    self.counters.rx_network();
                    self.fan_out_to_guests(family, &data, None);
                }
                Origin::Guest(family, ifname) => {
                    self.counters.rx_guest();
                    self.relay_from_guest(family, &ifname, &mut data, src);
                }
            },
        }
    }

    /// Best-effort copy of `data` to every guest socket of `family`, except
    /// `exclude`. A slow or broken guest never blocks delivery to the rest.
    fn fan_out_to_guests(&mut self, family: IpFamily, data: &[u8], exclude: Option<&str>) {
        let dst = mcast_dst(&self.config, family);
        for ((guest_family, ifname), guest) in self.guests.iter_mut() {
            if *guest_family != family {
                continue;
            }
            if exclude == Some(ifname.as_str()) {
                continue;
            }
            match guest.socket.try_send_to(data, dst) {
                Ok(_) => {
                    guest.last_errno = None;
                    self.counters.tx_guest();
                }
                Err(err) => {
                    note_socket_error(&mut guest.last_errno, "relay", ifname, &err);
                    self.counters.send_failure();
                }
            }
        }
    }

    fn relay_from_guest(
        &mut self,
        family: IpFamily,
        ifname: &str,
        data: &mut Vec<u8>,
        src: SocketAddr,
    ) {
        // A guest advertising its own private address would be unreachable
        // from the LAN; substitute the physical interface's address.
        if self.config.translate_local_records && family == IpFamily::V4 {
            if let (Some(lan_ip), IpAddr::V4(guest_ip)) = (self.lan_addr, src.ip()) {
                let rewritten = translate_mdns_ip(lan_ip, guest_ip, data);
                if rewritten > 0 {
                    debug!("rewrote {rewritten} mdns records from {ifname} to {lan_ip}");
                }
            }
        }

        self.send_to_network(family, src.port(), data);

        if self.config.guest_to_guest {
            self.fan_out_to_guests(family, data, Some(ifname));
        }
    }

    /// Sends a guest datagram out of the physical interface. Datagrams
    /// already sourced from the protocol port reuse the upstream socket;
    /// anything else goes through a short-lived socket bound to the original
    /// source port so replies find their way back.
    fn send_to_network(&mut self, family: IpFamily, src_port: u16, data: &[u8]) {
        let dst = mcast_dst(&self.config, family);

        if src_port == self.config.port {
            let Some(lan) = self.lan_sockets.get_mut(&family) else {
                debug!("no upstream {family:?} socket; dropping guest datagram");
                return;
            };
            match lan.socket.try_send_to(data, dst) {
                Ok(_) => {
                    lan.last_errno = None;
                    self.counters.tx_network();
                }
                Err(err) => {
                    note_socket_error(&mut lan.last_errno, "send upstream", &self.lan_ifname, &err);
                    self.counters.send_failure();
                }
            }
            return;
        }

        let sent = self
            .factory
            .bind_mcast_sender(family, &self.lan_ifname, src_port)
            .and_then(|socket| socket.send_to(data, dst));
        match sent {
            Ok(_) => {
                self.sender_errno = None;
                self.counters.tx_network();
            }
            Err(err) => {
                note_socket_error(&mut self.sender_errno, "send upstream", &self.lan_ifname, &err);
                self.counters.send_failure();
            }
        }
    }

    #[cfg(test)]
    fn guest_count(&self, ifname: &str) -> usize {
        self.guests.keys().filter(|(_, name)| name == ifname).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelayProtocol;
    use std::net::UdpSocket as StdUdpSocket;
    use std::time::Duration;

    /// Binds plain loopback sockets so the engine can run without multicast
    /// routing or interface privileges.
    struct LoopbackFactory;

    impl SocketFactory for LoopbackFactory {
        fn bind_multicast(
            &self,
            family: IpFamily,
            _ifname: &str,
            _config: &RelayConfig,
        ) -> io::Result<UdpSocket> {
            let std_socket = match family {
                IpFamily::V4 => StdUdpSocket::bind("127.0.0.1:0")?,
                IpFamily::V6 => StdUdpSocket::bind("[::1]:0")?,
            };
            std_socket.set_nonblocking(true)?;
            UdpSocket::from_std(std_socket)
        }

        fn bind_mcast_sender(
            &self,
            family: IpFamily,
            _ifname: &str,
            _src_port: u16,
        ) -> io::Result<StdUdpSocket> {
            match family {
                IpFamily::V4 => StdUdpSocket::bind("127.0.0.1:0"),
                IpFamily::V6 => StdUdpSocket::bind("[::1]:0"),
            }
        }
    }

    /// A config whose "group" is a loopback receiver, so relayed datagrams
    /// can be observed.
    fn test_config(receiver_port: u16) -> RelayConfig {
        RelayConfig {
            protocol: RelayProtocol::Mdns,
            mcast_addr4: Ipv4Addr::LOCALHOST,
            mcast_addr6: std::net::Ipv6Addr::LOCALHOST,
            port: receiver_port,
            translate_local_records: true,
            guest_to_guest: true,
        }
    }

    fn forwarder(receiver_port: u16) -> MulticastForwarder<LoopbackFactory> {
        MulticastForwarder::with_factory(
            test_config(receiver_port),
            "lan0",
            LoopbackFactory,
            RelayCounters::new(),
        )
    }

    async fn recv_payload(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for relayed datagram")
            .expect("recv failed");
        buf[..n].to_vec()
    }

    async fn receiver() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn add_guest_is_idempotent() {
        let mut fwd = forwarder(5353);
        assert!(fwd.add_guest("arc0"));
        // One socket per family, no more.
        assert_eq!(2, fwd.guest_count("arc0"));

        assert!(!fwd.add_guest("arc0"));
        assert_eq!(2, fwd.guest_count("arc0"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn remove_guest_tolerates_unknown_interface() {
        let mut fwd = forwarder(5353);
        fwd.add_guest("arc0");
        let count = fwd.guests.len();

        fwd.remove_guest("tap9");
        assert_eq!(count, fwd.guests.len());

        fwd.remove_guest("arc0");
        assert!(fwd.guests.is_empty());
        assert!(!fwd.has_guest("arc0"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lan_datagram_fans_out_to_every_guest() {
        let (receiver, port) = receiver().await;
        let mut fwd = forwarder(port);
        fwd.add_guest("arc0");
        fwd.add_guest("vmtap1");

        fwd.handle_incoming(Incoming::Datagram {
            origin: Origin::Lan(IpFamily::V4),
            data: b"discovery".to_vec(),
            src: "192.168.1.20:5353".parse().unwrap(),
        });

        // One copy per IPv4 guest socket.
        assert_eq!(b"discovery".to_vec(), recv_payload(&receiver).await);
        assert_eq!(b"discovery".to_vec(), recv_payload(&receiver).await);

        let snapshot = fwd.counters.snapshot();
        assert_eq!(1, snapshot.rx_network);
        assert_eq!(2, snapshot.tx_guest);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn guest_datagram_reaches_network_and_other_guests_only() {
        let (receiver, port) = receiver().await;
        let mut fwd = forwarder(port);
        fwd.add_guest("arc0");
        fwd.add_guest("vmtap1");

        fwd.handle_incoming(Incoming::Datagram {
            origin: Origin::Guest(IpFamily::V4, "arc0".to_string()),
            data: b"M-SEARCH".to_vec(),
            // Source port differs from the protocol port: short-lived sender.
            src: "127.0.0.1:40000".parse().unwrap(),
        });

        // Upstream copy plus exactly one peer copy (originator excluded).
        assert_eq!(b"M-SEARCH".to_vec(), recv_payload(&receiver).await);
        assert_eq!(b"M-SEARCH".to_vec(), recv_payload(&receiver).await);

        let snapshot = fwd.counters.snapshot();
        assert_eq!(1, snapshot.rx_guest);
        assert_eq!(1, snapshot.tx_network);
        assert_eq!(1, snapshot.tx_guest);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn guest_mdns_records_are_translated() {
        let (receiver, port) = receiver().await;
        let mut fwd = forwarder(port);
        let lan_ip = Ipv4Addr::new(192, 168, 1, 5);
        fwd.handle_event(ForwarderEvent::LanAddrChanged(Some(lan_ip)));
        fwd.add_guest("arc0");

        // A guest at 127.0.0.1 advertising its own address.
        let guest_ip = Ipv4Addr::new(127, 0, 0, 1);
        let payload = mdns_answer(guest_ip);
        let expected = mdns_answer(lan_ip);

        fwd.handle_incoming(Incoming::Datagram {
            origin: Origin::Guest(IpFamily::V4, "arc0".to_string()),
            data: payload,
            src: SocketAddr::new(IpAddr::V4(guest_ip), 40001),
        });

        assert_eq!(expected, recv_payload(&receiver).await);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_loop_applies_lifecycle_events() {
        let (tx, rx) = mpsc::channel(8);
        let fwd = forwarder(5353);
        let task = tokio::spawn(fwd.run(rx));

        tx.send(ForwarderEvent::AddGuest("arc0".to_string()))
            .await
            .unwrap();
        tx.send(ForwarderEvent::RemoveGuest("arc0".to_string()))
            .await
            .unwrap();
        drop(tx);

        // Channel closure terminates the forwarder.
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("forwarder did not stop")
            .unwrap();
    }

    /// Minimal mDNS answer with a single A record for `addr`.
    fn mdns_answer(addr: Ipv4Addr) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0x8400u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        for label in ["guest", "local"] {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&1u16.to_be_bytes()); // A
        out.extend_from_slice(&0x8001u16.to_be_bytes());
        out.extend_from_slice(&120u32.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&addr.octets());
        out
    }
}
