use std::io;
use std::net::Ipv4Addr;

use shunt_firewall::{Firewall, SysCommandRunner};
use shunt_metrics::{
    CounterSource, MetricsEvent, MulticastMetrics, ProtocolCounts, Technology, TracingUsageSink,
};
use shunt_relay::{
    BroadcastEvent, BroadcastForwarder, ForwarderEvent, MulticastForwarder, RelayConfig,
    RelayCounters, RelayProtocol,
};
use shunt_routing::RoutingService;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::Config;

const EVENT_QUEUE_DEPTH: usize = 32;

/// [`CounterSource`] over the daemon's relay instances.
///
/// The daemon steers a single physical uplink, so every technology poller
/// observes the same relay counters; attribution by technology happens
/// through which pollers the caller starts.
pub struct RelayCounterSource {
    mdns: RelayCounters,
    ssdp: RelayCounters,
}

impl CounterSource for RelayCounterSource {
    fn protocol_counts(&self, _technology: Technology) -> Option<ProtocolCounts> {
        let mut counts = ProtocolCounts::new();
        counts.insert(RelayProtocol::Mdns, self.mdns.snapshot().rx_total());
        counts.insert(RelayProtocol::Ssdp, self.ssdp.snapshot().rx_total());
        Some(counts)
    }
}

/// The running traffic-steering core: relay tasks, usage metrics, and the
/// synchronous firewall and routing services.
///
/// Guest interface lifecycle and address-change discovery are external
/// collaborators; they feed the daemon through [`DaemonHandle`].
pub struct Daemon {
    handle: DaemonHandle,
    firewall: Firewall<SysCommandRunner>,
    routing: RoutingService,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct DaemonHandle {
    relays: Vec<mpsc::Sender<ForwarderEvent>>,
    broadcast: Option<mpsc::Sender<BroadcastEvent>>,
    metrics: mpsc::Sender<MetricsEvent>,
}

impl Daemon {
    /// Binds every enabled relay on the physical interface and spawns their
    /// tasks on the current runtime.
    pub fn start(config: Config) -> io::Result<Self> {
        let mdns_counters = RelayCounters::new();
        let ssdp_counters = RelayCounters::new();

        let mut relays = Vec::new();
        let mut tasks = Vec::new();

        let relay_setups = [
            (config.enable_mdns, RelayConfig::mdns(), &mdns_counters),
            (config.enable_ssdp, RelayConfig::ssdp(), &ssdp_counters),
        ];
        for (enable, relay_config, counters) in relay_setups {
            if !enable {
                continue;
            }
            let mut forwarder =
                MulticastForwarder::new(relay_config, &config.lan_ifname, counters.clone());
            forwarder.init()?;
            let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
            tasks.push(tokio::spawn(forwarder.run(rx)));
            relays.push(tx);
        }

        let broadcast = if config.enable_broadcast {
            let mut forwarder =
                BroadcastForwarder::new(&config.lan_ifname, RelayCounters::new());
            forwarder.init()?;
            let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
            tasks.push(tokio::spawn(forwarder.run(rx)));
            Some(tx)
        } else {
            None
        };

        let metrics = MulticastMetrics::new(
            RelayCounterSource {
                mdns: mdns_counters,
                ssdp: ssdp_counters,
            },
            TracingUsageSink,
        );
        let (metrics_tx, metrics_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        tasks.push(tokio::spawn(metrics.run(metrics_rx)));

        info!(lan = %config.lan_ifname, "traffic steering started");

        Ok(Self {
            handle: DaemonHandle {
                relays,
                broadcast,
                metrics: metrics_tx,
            },
            firewall: Firewall::new(SysCommandRunner, config.lockdown_user),
            routing: RoutingService::new(),
            tasks,
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// Firewall service for the daemon's RPC surface.
    pub fn firewall(&self) -> &Firewall<SysCommandRunner> {
        &self.firewall
    }

    /// Socket tagging service for the daemon's RPC surface.
    pub fn routing(&self) -> &RoutingService {
        &self.routing
    }

    /// Closes the lifecycle channels and waits for every task to drain.
    pub async fn shutdown(self) {
        drop(self.handle);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl DaemonHandle {
    /// Starts relaying to a guest interface on every enabled relay.
    pub async fn add_guest(&self, ifname: &str) {
        for tx in &self.relays {
            let _ = tx.send(ForwarderEvent::AddGuest(ifname.to_string())).await;
        }
        if let Some(tx) = &self.broadcast {
            let _ = tx.send(BroadcastEvent::AddGuest(ifname.to_string())).await;
        }
    }

    /// Stops relaying to a guest interface.
    pub async fn remove_guest(&self, ifname: &str) {
        for tx in &self.relays {
            let _ = tx
                .send(ForwarderEvent::RemoveGuest(ifname.to_string()))
                .await;
        }
        if let Some(tx) = &self.broadcast {
            let _ = tx
                .send(BroadcastEvent::RemoveGuest(ifname.to_string()))
                .await;
        }
    }

    /// Propagates a physical-interface IPv4 address change to every relay.
    pub async fn notify_lan_addr(&self, addr: Option<Ipv4Addr>) {
        for tx in &self.relays {
            let _ = tx.send(ForwarderEvent::LanAddrChanged(addr)).await;
        }
        if let Some(tx) = &self.broadcast {
            let _ = tx.send(BroadcastEvent::LanAddrChanged).await;
        }
    }

    /// Forwards a device or VM lifecycle event to the metrics layer.
    pub async fn notify_metrics(&self, event: MetricsEvent) {
        let _ = self.metrics.send(event).await;
    }
}
