#![forbid(unsafe_code)]

//! Fwmark bitfield model.
//!
//! A fwmark is a 32-bit value attached to a socket (`SO_MARK`) or a packet,
//! consumed by kernel policy routing to pick a routing table and by firewall
//! rules to match traffic. The daemon packs five disjoint fields into it:
//!
//! ```text
//!  31            16 15 14 13 12        8 7     5 4   1 0
//! +----------------+--+--+--+-----------+-------+-----+-+
//! | routing table  |vpn  |fwd| source    | qos   |     |S|
//! +----------------+--+--+--+-----------+-------+-----+-+
//! ```
//!
//! The layout is part of the external interface: the kernel-side policy
//! routing and firewall configuration match on these exact masks, so the
//! constants below must never change value.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not};

/// Union of all traffic-source bits, including the forwarded flag.
pub const ALL_SOURCES_MASK: Fwmark = Fwmark(0x00003f00);
/// Policy-routing table selector, high 16 bits.
pub const ROUTING_MASK: Fwmark = Fwmark(0xffff0000);
/// Single bit retained for compatibility with the deprecated SNAT marking
/// scheme.
pub const LEGACY_SNAT: Fwmark = Fwmark(0x00000001);
/// Both VPN policy bits.
pub const VPN_MASK: Fwmark = Fwmark(0x0000c000);
/// Traffic explicitly routed through the VPN.
pub const ROUTE_ON_VPN: Fwmark = Fwmark(0x00008000);
/// Traffic explicitly kept off the VPN.
pub const BYPASS_VPN: Fwmark = Fwmark(0x00004000);
/// Set on traffic originated by a guest rather than by the host itself.
pub const FORWARDED_SOURCES_MASK: Fwmark = Fwmark(0x00002000);
/// QoS category, 3 bits.
pub const QOS_CATEGORY_MASK: Fwmark = Fwmark(0x000000e0);

const QOS_SHIFT: u32 = 5;
const SOURCE_SHIFT: u32 = 8;
const ROUTING_SHIFT: u32 = 16;

/// Producer class of a socket or packet.
///
/// The discriminant is the raw 6-bit source field (bits 8-13 of the fwmark).
/// Bit 5 of the discriminant is the forwarded flag: it is clear for every
/// host-originated source and set for every guest-originated source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrafficSource {
    Unknown = 0x00,
    /// The host browser process.
    Browser = 0x01,
    /// An arbitrary user process.
    User = 0x02,
    /// The system update service.
    Updater = 0x03,
    /// Host system daemons.
    System = 0x04,
    /// The host-side VPN client.
    HostVpn = 0x05,
    /// A generic guest VM.
    Guest = 0x20,
    /// Application containers.
    AppContainer = 0x21,
    /// System containers.
    SystemContainer = 0x22,
    /// A tethering downstream network.
    TetherDownstream = 0x23,
    /// A VPN client running inside a guest.
    GuestVpn = 0x24,
}

/// All host-originated sources.
pub const LOCAL_SOURCES: &[TrafficSource] = &[
    TrafficSource::Unknown,
    TrafficSource::Browser,
    TrafficSource::User,
    TrafficSource::Updater,
    TrafficSource::System,
    TrafficSource::HostVpn,
];

/// All guest-originated sources.
pub const FORWARDED_SOURCES: &[TrafficSource] = &[
    TrafficSource::Guest,
    TrafficSource::AppContainer,
    TrafficSource::SystemContainer,
    TrafficSource::TetherDownstream,
    TrafficSource::GuestVpn,
];

/// QoS category carried in bits 5-7 of the fwmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum QosCategory {
    #[default]
    Default = 0,
    RealTimeInteractive = 1,
    MultimediaConferencing = 2,
    NetworkControl = 3,
    WebRtc = 4,
}

/// An immutable 32-bit fwmark value.
///
/// Fwmarks are computed on demand from a (source, VPN policy, QoS category)
/// tuple and applied to a socket or a firewall rule; they are never stored
/// against a long-lived object. Combining two fwmarks with the bitwise
/// operators only ever touches the intended field as long as call sites pass
/// the corresponding mask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fwmark(u32);

impl Fwmark {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// The fwmark carrying only the source field for `source`.
    pub const fn from_source(source: TrafficSource) -> Self {
        Self((source as u32) << SOURCE_SHIFT)
    }

    /// The fwmark carrying only the QoS category field for `category`.
    pub const fn from_qos_category(category: QosCategory) -> Self {
        Self((category as u32) << QOS_SHIFT)
    }

    /// The fwmark carrying only the routing-table selector for `table`.
    pub const fn from_routing_table(table: u16) -> Self {
        Self((table as u32) << ROUTING_SHIFT)
    }

    /// The raw QoS category field value (unshifted).
    pub const fn qos_category(self) -> u32 {
        (self.0 & QOS_CATEGORY_MASK.0) >> QOS_SHIFT
    }
}

impl BitAnd for Fwmark {
    type Output = Fwmark;

    fn bitand(self, rhs: Fwmark) -> Fwmark {
        Fwmark(self.0 & rhs.0)
    }
}

impl BitOr for Fwmark {
    type Output = Fwmark;

    fn bitor(self, rhs: Fwmark) -> Fwmark {
        Fwmark(self.0 | rhs.0)
    }
}

impl BitXor for Fwmark {
    type Output = Fwmark;

    fn bitxor(self, rhs: Fwmark) -> Fwmark {
        Fwmark(self.0 ^ rhs.0)
    }
}

impl Not for Fwmark {
    type Output = Fwmark;

    fn not(self) -> Fwmark {
        Fwmark(!self.0)
    }
}

impl fmt::Display for Fwmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for Fwmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fwmark({:#010x})", self.0)
    }
}
