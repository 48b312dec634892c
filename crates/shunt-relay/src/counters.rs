use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared packet counters for one relay instance.
///
/// Incremented by the forwarder task, read by the metrics layer; cloning is
/// cheap and every clone observes the same counters.
#[derive(Clone, Default)]
pub struct RelayCounters {
    inner: Arc<CountersInner>,
}

#[derive(Default)]
struct CountersInner {
    rx_network_total: AtomicU64,
    rx_guest_total: AtomicU64,
    tx_guest_total: AtomicU64,
    tx_network_total: AtomicU64,
    send_fail_total: AtomicU64,
}

/// Point-in-time copy of [`RelayCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub rx_network: u64,
    pub rx_guest: u64,
    pub tx_guest: u64,
    pub tx_network: u64,
    pub send_failures: u64,
}

impl RelaySnapshot {
    /// Datagrams this relay has taken in, in either direction.
    pub fn rx_total(&self) -> u64 {
        self.rx_network + self.rx_guest
    }
}

impl RelayCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rx_network(&self) {
        self.inner.rx_network_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rx_guest(&self) {
        self.inner.rx_guest_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx_guest(&self) {
        self.inner.tx_guest_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx_network(&self) {
        self.inner.tx_network_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failure(&self) {
        self.inner.send_fail_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            rx_network: self.inner.rx_network_total.load(Ordering::Relaxed),
            rx_guest: self.inner.rx_guest_total.load(Ordering::Relaxed),
            tx_guest: self.inner.tx_guest_total.load(Ordering::Relaxed),
            tx_network: self.inner.tx_network_total.load(Ordering::Relaxed),
            send_failures: self.inner.send_fail_total.load(Ordering::Relaxed),
        }
    }
}
