use std::collections::HashMap;
use std::future::poll_fn;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::task::{Context, Poll};

use socket2::Socket;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::counters::RelayCounters;
use crate::packet::{parse_udp_ipv4, UdpDatagramV4};
use crate::socket::{note_socket_error, BcastSocketFactory, InterfaceIpv4, NetSocketFactory};

const BCAST_BUF_SIZE: usize = 8192;

/// Lifecycle commands delivered to a running broadcast forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    AddGuest(String),
    RemoveGuest(String),
    /// The physical interface's IPv4 addressing changed; its socket is
    /// recreated with the refreshed address/broadcast/netmask triple.
    LanAddrChanged,
}

struct BcastSocket {
    rx: AsyncFd<Socket>,
    /// Long-lived broadcast sender on the same interface, used for
    /// LAN-to-guest delivery.
    tx: StdUdpSocket,
    iface: InterfaceIpv4,
    last_errno: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    Network,
    Guest(String),
}

enum Incoming {
    Frame { origin: Origin, frame: Vec<u8> },
    ReadError { origin: Origin, err: io::Error },
}

/// Relays IPv4 broadcasts between one physical interface and its guests.
///
/// Unlike the multicast relay there is no guest-to-guest path: broadcast is
/// link-scoped, so traffic only crosses between the LAN and each guest
/// interface. Guest addressing is assumed constant for the lifetime of a map
/// entry; the physical interface's addressing is refreshed on
/// [`BroadcastEvent::LanAddrChanged`].
pub struct BroadcastForwarder<F = NetSocketFactory> {
    dev_ifname: String,
    factory: F,
    dev_socket: Option<BcastSocket>,
    guests: HashMap<String, BcastSocket>,
    counters: RelayCounters,
    /// Errno memory for the short-lived network sender path.
    sender_errno: Option<i32>,
}

impl BroadcastForwarder<NetSocketFactory> {
    pub fn new(dev_ifname: impl Into<String>, counters: RelayCounters) -> Self {
        Self::with_factory(dev_ifname, NetSocketFactory, counters)
    }
}

impl<F: BcastSocketFactory> BroadcastForwarder<F> {
    pub fn with_factory(dev_ifname: impl Into<String>, factory: F, counters: RelayCounters) -> Self {
        Self {
            dev_ifname: dev_ifname.into(),
            factory,
            dev_socket: None,
            guests: HashMap::new(),
            counters,
            sender_errno: None,
        }
    }

    /// Binds the listener on the physical interface.
    pub fn init(&mut self) -> io::Result<()> {
        self.dev_socket = Some(self.open(&self.dev_ifname)?);
        Ok(())
    }

    fn open(&self, ifname: &str) -> io::Result<BcastSocket> {
        let iface = self.factory.interface_ipv4(ifname)?;
        let rx = self.factory.bind_broadcast_listener(ifname)?;
        let tx = self.factory.bind_broadcast_sender(ifname, 0)?;
        Ok(BcastSocket {
            rx,
            tx,
            iface,
            last_errno: None,
        })
    }

    /// Starts relaying broadcasts to and from `ifname`. Re-adding a
    /// forwarded interface is a no-op; returns whether anything was added.
    pub fn add_guest(&mut self, ifname: &str) -> bool {
        if self.guests.contains_key(ifname) {
            debug!("already forwarding broadcasts to {ifname}");
            return false;
        }
        match self.open(ifname) {
            Ok(socket) => {
                self.guests.insert(ifname.to_string(), socket);
                info!(
                    "forwarding broadcasts between {} and {ifname}",
                    self.dev_ifname,
                );
                true
            }
            Err(err) => {
                warn!("cannot bind broadcast sockets on {ifname}: {err}");
                false
            }
        }
    }

    /// Stops relaying to `ifname`; unknown interfaces are a no-op.
    pub fn remove_guest(&mut self, ifname: &str) {
        if self.guests.remove(ifname).is_some() {
            info!("stopped forwarding broadcasts to {ifname}");
        }
    }

    pub fn has_guest(&self, ifname: &str) -> bool {
        self.guests.contains_key(ifname)
    }

    /// Drives the forwarder until the event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<BroadcastEvent>) {
        info!(lan = %self.dev_ifname, "broadcast forwarder running");
        loop {
            enum Step {
                Command(Option<BroadcastEvent>),
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
        info!("broadcast forwarder stopped");
    }

    fn handle_event(&mut self, event: BroadcastEvent) {
        match event {
            BroadcastEvent::AddGuest(ifname) => {
                self.add_guest(&ifname);
            }
            BroadcastEvent::RemoveGuest(ifname) => self.remove_guest(&ifname),
            BroadcastEvent::LanAddrChanged => match self.open(&self.dev_ifname) {
                Ok(socket) => {
                    info!(
                        "rebound broadcast listener on {} at {}",
                        self.dev_ifname, socket.iface.addr,
                    );
                    self.dev_socket = Some(socket);
                }
                Err(err) => {
                    warn!("cannot rebind broadcast listener on {}: {err}", self.dev_ifname);
                    self.dev_socket = None;
                }
            },
        }
    }

    fn poll_incoming(&mut self, cx: &mut Context<'_>) -> Poll<Incoming> {
        if let Some(dev) = &self.dev_socket {
            if let Poll::Ready(incoming) = poll_raw_socket(&dev.rx, Origin::Network, cx) {
                return Poll::Ready(incoming);
            }
        }
        for (ifname, guest) in &self.guests {
            let origin = Origin::Guest(ifname.clone());
            if let Poll::Ready(incoming) = poll_raw_socket(&guest.rx, origin, cx) {
                return Poll::Ready(incoming);
            }
        }
        Poll::Pending
    }

    fn handle_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::ReadError { origin, err } => {
                let last_errno = match &origin {
                    Origin::Network => self.dev_socket.as_mut().map(|s| &mut s.last_errno),
                    Origin::Guest(ifname) => {
                        self.guests.get_mut(ifname).map(|s| &mut s.last_errno)
                    }
                };
                if let Some(last_errno) = last_errno {
                    note_socket_error(last_errno, "receive", &format!("{origin:?}"), &err);
                }
            }
            Incoming::Frame { origin, frame } => match origin {
                Origin::Network => self.handle_network_frame(&frame),
                Origin::Guest(ifname) => self.handle_guest_frame(&ifname, &frame),
            },
        }
    }

    fn handle_network_frame(&mut self, frame: &[u8]) {
        let Some(dev) = &self.dev_socket else {
            return;
        };
        let Some(datagram) = accept_broadcast(frame, &dev.iface) else {
            return;
        };
        self.counters.rx_network();
        self.send_to_guests(datagram.payload, datagram.dst_port);
    }

    fn handle_guest_frame(&mut self, ifname: &str, frame: &[u8]) {
        let Some(guest) = self.guests.get(ifname) else {
            return;
        };
        let Some(datagram) = accept_broadcast(frame, &guest.iface) else {
            return;
        };
        self.counters.rx_guest();

        let Some(dev) = &self.dev_socket else {
            debug!("no upstream broadcast socket; dropping guest broadcast");
            return;
        };
        let dst = SocketAddrV4::new(dev.iface.broadcast, datagram.dst_port);
        self.send_to_network(datagram.src_port, datagram.payload, dst);
    }

    /// Best-effort delivery of `payload` to every guest's broadcast address.
    fn send_to_guests(&mut self, payload: &[u8], dst_port: u16) {
        for (ifname, guest) in self.guests.iter_mut() {
            let dst = SocketAddrV4::new(guest.iface.broadcast, dst_port);
            match guest.tx.send_to(payload, dst) {
                Ok(_) => {
                    guest.last_errno = None;
                    self.counters.tx_guest();
                }
                Err(err) => {
                    note_socket_error(&mut guest.last_errno, "relay broadcast", ifname, &err);
                    self.counters.send_failure();
                }
            }
        }
    }

    /// Sends a guest broadcast out of the physical interface from a
    /// short-lived socket bound to the originating source port, so replies
    /// appear to come from the right endpoint.
    fn send_to_network(&mut self, src_port: u16, payload: &[u8], dst: SocketAddrV4) {
        let sent = self
            .factory
            .bind_broadcast_sender(&self.dev_ifname, src_port)
            .and_then(|socket| socket.send_to(payload, dst));
        match sent {
            Ok(_) => {
                self.sender_errno = None;
                self.counters.tx_network();
            }
            Err(err) => {
                note_socket_error(
                    &mut self.sender_errno,
                    "send broadcast upstream",
                    &self.dev_ifname,
                    &err,
                );
                self.counters.send_failure();
            }
        }
    }
}

/// Accepts a raw frame when it is a UDP broadcast heard on `iface` that we
/// did not send ourselves.
fn accept_broadcast<'a>(frame: &'a [u8], iface: &InterfaceIpv4) -> Option<UdpDatagramV4<'a>> {
    let datagram = parse_udp_ipv4(frame).ok()?;
    if datagram.dst != iface.broadcast && datagram.dst != Ipv4Addr::BROADCAST {
        return None;
    }
    // Our own relayed sends are sourced from the interface address; skip
    // them to avoid forwarding loops.
    if datagram.src == iface.addr {
        return None;
    }
    Some(datagram)
}

fn poll_raw_socket(rx: &AsyncFd<Socket>, origin: Origin, cx: &mut Context<'_>) -> Poll<Incoming> {
    loop {
        let mut guard = match rx.poll_read_ready(cx) {
            Poll::Ready(Ok(guard)) => guard,
            Poll::Ready(Err(err)) => return Poll::Ready(Incoming::ReadError { origin, err }),
            Poll::Pending => return Poll::Pending,
        };
        let mut buf = [0u8; BCAST_BUF_SIZE];
        match guard.try_io(|inner| {
            let mut socket = inner.get_ref();
            socket.read(&mut buf)
        }) {
            Ok(Ok(n)) => {
                return Poll::Ready(Incoming::Frame {
                    origin,
                    frame: buf[..n].to_vec(),
                });
            }
            Ok(Err(err)) => return Poll::Ready(Incoming::ReadError { origin, err }),
            // Spurious readiness; re-arm and try again.
            Err(_would_block) => continue,
        }
    }
}
