#![forbid(unsafe_code)]

//! Multicast usage metrics.
//!
//! Observes interface lifecycle events and the relay engines' packet
//! counters, and periodically emits per-technology usage deltas. Adds no
//! protocol logic of its own: counters come from an injected
//! [`CounterSource`], records go to an injected [`UsageSink`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use shunt_relay::RelayProtocol;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delay between usage polls.
const POLL_DELAY: Duration = Duration::from_secs(120);

/// Technology axis a poller aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technology {
    /// Every connected physical interface.
    Total,
    Ethernet,
    Wifi,
    /// Traffic forwarded into guest VMs; only polled while a VM runs.
    GuestVm,
}

impl Technology {
    pub fn label(self) -> &'static str {
        match self {
            Technology::Total => "total",
            Technology::Ethernet => "ethernet",
            Technology::Wifi => "wifi",
            Technology::GuestVm => "guest-vm",
        }
    }
}

/// Physical device class, as reported by the interface lifecycle source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTechnology {
    Ethernet,
    Wifi,
    Other,
}

/// A physical device lifecycle notification.
#[derive(Debug, Clone)]
pub struct Device {
    pub ifname: String,
    pub technology: DeviceTechnology,
    pub connected: bool,
}

/// Per-protocol packet totals for one technology.
pub type ProtocolCounts = HashMap<RelayProtocol, u64>;

/// Source of cumulative multicast packet counts.
pub trait CounterSource {
    /// Current totals for `technology`, or `None` when unavailable.
    fn protocol_counts(&self, technology: Technology) -> Option<ProtocolCounts>;
}

/// Destination for periodic usage records.
pub trait UsageSink {
    fn record(&self, technology: Technology, protocol: RelayProtocol, delta: u64);
}

/// Sink that reports usage through the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, technology: Technology, protocol: RelayProtocol, delta: u64) {
        info!(
            technology = technology.label(),
            protocol = protocol.label(),
            packets = delta,
            "multicast usage",
        );
    }
}

/// Events consumed by [`MulticastMetrics::run`].
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    DeviceAdded(Device),
    DeviceRemoved(Device),
    IpConfigChanged(Device),
    /// A guest VM started or stopped.
    VmStateChanged(bool),
    /// Forwarding into the VM was enabled or disabled.
    VmForwarderStateChanged(bool),
}

/// Tracks which interfaces are active for one technology and snapshots
/// counters between polls.
struct Poller {
    technology: Technology,
    ifnames: HashSet<String>,
    active: bool,
    vm_running: bool,
    vm_forwarding: bool,
    baseline: ProtocolCounts,
}

impl Poller {
    fn new(technology: Technology) -> Self {
        Self {
            technology,
            ifnames: HashSet::new(),
            active: false,
            vm_running: false,
            vm_forwarding: false,
            baseline: ProtocolCounts::new(),
        }
    }

    fn start(&mut self, ifname: &str, source: &dyn CounterSource) {
        if !self.ifnames.insert(ifname.to_string()) {
            return;
        }
        if self.ifnames.len() > 1 {
            // Poll already running for an earlier interface.
            return;
        }
        // The guest poller only runs while there is both a connected
        // interface and a running VM.
        if self.technology == Technology::GuestVm && !self.vm_running {
            return;
        }
        self.activate(source);
    }

    fn stop(&mut self, ifname: &str) {
        if !self.ifnames.remove(ifname) || !self.ifnames.is_empty() {
            return;
        }
        if self.technology == Technology::GuestVm && !self.vm_running {
            return;
        }
        self.deactivate();
    }

    fn update_vm_state(&mut self, running: bool, source: &dyn CounterSource) {
        if self.vm_running == running {
            return;
        }
        self.vm_running = running;
        if self.ifnames.is_empty() {
            return;
        }
        if running {
            self.activate(source);
        } else {
            self.deactivate();
        }
    }

    fn update_vm_forwarder_state(&mut self, enabled: bool, source: &dyn CounterSource) {
        if self.vm_forwarding == enabled {
            return;
        }
        self.vm_forwarding = enabled;
        if !self.vm_running {
            return;
        }
        // Restart polling so the delta window does not straddle the
        // forwarding change.
        self.deactivate();
        self.activate(source);
    }

    fn activate(&mut self, source: &dyn CounterSource) {
        let Some(counts) = source.protocol_counts(self.technology) else {
            warn!(
                technology = self.technology.label(),
                "cannot fetch multicast packet counts",
            );
            return;
        };
        self.baseline = counts;
        self.active = true;
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.baseline.clear();
    }

    fn record(&mut self, source: &dyn CounterSource, sink: &dyn UsageSink) {
        if !self.active {
            return;
        }
        let Some(counts) = source.protocol_counts(self.technology) else {
            warn!(
                technology = self.technology.label(),
                "cannot fetch multicast packet counts",
            );
            return;
        };
        for (&protocol, &count) in &counts {
            let previous = self.baseline.get(&protocol).copied().unwrap_or(0);
            sink.record(self.technology, protocol, count.saturating_sub(previous));
        }
        self.baseline = counts;
    }
}

/// Usage metrics over every relay instance, keyed by technology.
pub struct MulticastMetrics<S, K> {
    pollers: HashMap<Technology, Poller>,
    source: S,
    sink: K,
}

impl<S: CounterSource, K: UsageSink> MulticastMetrics<S, K> {
    pub fn new(source: S, sink: K) -> Self {
        let mut pollers = HashMap::new();
        for technology in [
            Technology::Total,
            Technology::Ethernet,
            Technology::Wifi,
            Technology::GuestVm,
        ] {
            pollers.insert(technology, Poller::new(technology));
        }
        Self {
            pollers,
            source,
            sink,
        }
    }

    pub fn start(&mut self, technology: Technology, ifname: &str) {
        if let Some(poller) = self.pollers.get_mut(&technology) {
            poller.start(ifname, &self.source);
        }
    }

    pub fn stop(&mut self, technology: Technology, ifname: &str) {
        if let Some(poller) = self.pollers.get_mut(&technology) {
            poller.stop(ifname);
        }
    }

    pub fn on_device_added(&mut self, device: &Device) {
        if device.connected {
            self.start_device(device);
        }
    }

    pub fn on_device_removed(&mut self, device: &Device) {
        self.stop_device(device);
    }

    pub fn on_ipconfig_changed(&mut self, device: &Device) {
        if device.connected {
            self.start_device(device);
        } else {
            self.stop_device(device);
        }
    }

    pub fn update_vm_state(&mut self, running: bool) {
        if let Some(poller) = self.pollers.get_mut(&Technology::GuestVm) {
            poller.update_vm_state(running, &self.source);
        }
    }

    pub fn update_vm_forwarder_state(&mut self, enabled: bool) {
        if let Some(poller) = self.pollers.get_mut(&Technology::GuestVm) {
            poller.update_vm_forwarder_state(enabled, &self.source);
        }
    }

    /// Emits one usage record per active poller and protocol.
    pub fn record_all(&mut self) {
        for poller in self.pollers.values_mut() {
            poller.record(&self.source, &self.sink);
        }
    }

    /// Drives periodic recording until the event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<MetricsEvent>) {
        let mut ticker = tokio::time::interval(POLL_DELAY);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; consume it so
        // the first delta covers a full poll window.
        ticker.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = ticker.tick() => self.record_all(),
            }
        }
        debug!("multicast metrics stopped");
    }

    fn handle_event(&mut self, event: MetricsEvent) {
        match event {
            MetricsEvent::DeviceAdded(device) => self.on_device_added(&device),
            MetricsEvent::DeviceRemoved(device) => self.on_device_removed(&device),
            MetricsEvent::IpConfigChanged(device) => self.on_ipconfig_changed(&device),
            MetricsEvent::VmStateChanged(running) => self.update_vm_state(running),
            MetricsEvent::VmForwarderStateChanged(enabled) => {
                self.update_vm_forwarder_state(enabled)
            }
        }
    }

    fn start_device(&mut self, device: &Device) {
        for technology in device_technologies(device) {
            self.start(technology, &device.ifname);
        }
    }

    fn stop_device(&mut self, device: &Device) {
        for technology in device_technologies(device) {
            self.stop(technology, &device.ifname);
        }
    }

    #[cfg(test)]
    fn poller(&self, technology: Technology) -> &Poller {
        &self.pollers[&technology]
    }
}

/// Pollers fed by a physical device: its own technology plus the total, and
/// for wifi the guest poller as well.
fn device_technologies(device: &Device) -> Vec<Technology> {
    match device.technology {
        DeviceTechnology::Ethernet => vec![Technology::Total, Technology::Ethernet],
        DeviceTechnology::Wifi => {
            vec![Technology::Total, Technology::Wifi, Technology::GuestVm]
        }
        DeviceTechnology::Other => Vec::new(),
    }
}
