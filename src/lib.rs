#![forbid(unsafe_code)]

//! Traffic-steering core of the host network daemon.
//!
//! Mediates connectivity between one physical interface and a set of guest
//! network namespaces: fwmark classification of sockets, firewall rule
//! management for opened and forwarded ports, and relay of link-local
//! discovery traffic (mDNS, SSDP, IPv4 broadcast) into every active guest.

mod config;
mod daemon;

pub use config::Config;
pub use daemon::{Daemon, DaemonHandle, RelayCounterSource};

// Re-exported for the daemon's RPC surface: tagging requests arrive in terms
// of these types.
pub use shunt_firewall::Protocol;
pub use shunt_fwmark::{Fwmark, QosCategory, TrafficSource};
pub use shunt_routing::VpnPolicy;
