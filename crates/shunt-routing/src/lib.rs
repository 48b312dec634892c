#![forbid(unsafe_code)]

//! Socket tagging service.
//!
//! Applies fwmark bits to live sockets through `SO_MARK`, either as a raw
//! (value, mask) pair or as a VPN routing intent. The two kernel calls are
//! abstracted behind [`MarkOps`] so the read-modify-write sequence can be
//! tested without a privileged socket.

use std::io;
use std::os::fd::BorrowedFd;

use nix::sys::socket::sockopt::Mark;
use shunt_fwmark::{Fwmark, BYPASS_VPN, ROUTE_ON_VPN, ROUTING_MASK, VPN_MASK};
use thiserror::Error;

/// Offset added to a network id to derive its policy-routing table number.
const ROUTING_TABLE_OFFSET: u32 = 1000;

/// Per-socket VPN routing intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VpnPolicy {
    /// Use default routing.
    #[default]
    Default,
    /// Force traffic onto the VPN path.
    RouteOnVpn,
    /// Keep traffic off the VPN path.
    BypassVpn,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    /// Validation failure, reported before any syscall is attempted.
    #[error("route-on-vpn cannot be combined with an explicit network id")]
    VpnWithNetworkId,
    /// Validation failure, reported before any syscall is attempted.
    #[error("network id {0} does not map to a valid routing table")]
    NetworkIdOutOfRange(u32),
    #[error("failed to read socket mark")]
    GetMark(#[source] io::Error),
    #[error("failed to write socket mark")]
    SetMark(#[source] io::Error),
}

/// Get/set of the 32-bit socket mark on a raw file descriptor.
pub trait MarkOps {
    fn get_mark(&self, fd: BorrowedFd<'_>) -> io::Result<u32>;
    fn set_mark(&self, fd: BorrowedFd<'_>, mark: u32) -> io::Result<()>;
}

/// [`MarkOps`] backed by `getsockopt`/`setsockopt` with `SOL_SOCKET`/`SO_MARK`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelMarkOps;

impl MarkOps for KernelMarkOps {
    fn get_mark(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        nix::sys::socket::getsockopt(&fd, Mark).map_err(io::Error::from)
    }

    fn set_mark(&self, fd: BorrowedFd<'_>, mark: u32) -> io::Result<()> {
        nix::sys::socket::setsockopt(&fd, Mark, &mark).map_err(io::Error::from)
    }
}

pub struct RoutingService<O = KernelMarkOps> {
    ops: O,
}

impl RoutingService<KernelMarkOps> {
    pub fn new() -> Self {
        Self { ops: KernelMarkOps }
    }
}

impl Default for RoutingService<KernelMarkOps> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: MarkOps> RoutingService<O> {
    pub fn with_ops(ops: O) -> Self {
        Self { ops }
    }

    /// Applies `value`, restricted to `mask`, onto the socket's existing mark.
    ///
    /// Bits outside `mask` are left untouched. The sequence is one mark read
    /// followed by one mark write; neither call is retried on failure.
    pub fn set_fwmark(
        &self,
        fd: BorrowedFd<'_>,
        value: Fwmark,
        mask: Fwmark,
    ) -> Result<(), RoutingError> {
        let old = self.ops.get_mark(fd).map_err(RoutingError::GetMark)?;
        let new = (old & !mask.value()) | (value & mask).value();
        self.ops.set_mark(fd, new).map_err(RoutingError::SetMark)
    }

    /// Tags a socket with a VPN routing intent and an optional target network.
    ///
    /// The 2-bit VPN field is always fully replaced, never accumulated, and
    /// the routing-table selector is cleared unless `network_id` names a
    /// network to pin the socket to. `RouteOnVpn` and an explicit network id
    /// are mutually exclusive; that combination fails before any syscall.
    pub fn tag_socket(
        &self,
        fd: BorrowedFd<'_>,
        network_id: Option<u32>,
        policy: VpnPolicy,
    ) -> Result<(), RoutingError> {
        if policy == VpnPolicy::RouteOnVpn && network_id.is_some() {
            return Err(RoutingError::VpnWithNetworkId);
        }

        let mut mark = match policy {
            VpnPolicy::Default => Fwmark::default(),
            VpnPolicy::RouteOnVpn => ROUTE_ON_VPN,
            VpnPolicy::BypassVpn => BYPASS_VPN,
        };
        if let Some(id) = network_id {
            let table = ROUTING_TABLE_OFFSET
                .checked_add(id)
                .and_then(|table| u16::try_from(table).ok())
                .ok_or(RoutingError::NetworkIdOutOfRange(id))?;
            mark = mark | Fwmark::from_routing_table(table);
        }

        self.set_fwmark(fd, mark, ROUTING_MASK | VPN_MASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::UdpSocket;
    use std::os::fd::{AsFd, AsRawFd, RawFd};

    /// Records mark reads/writes and serves scripted results.
    #[derive(Default)]
    struct FakeMarkOps {
        mark: RefCell<u32>,
        last_fd: RefCell<Option<RawFd>>,
        gets: RefCell<usize>,
        sets: RefCell<usize>,
        fail_get: bool,
        fail_set: bool,
    }

    impl FakeMarkOps {
        fn with_mark(mark: u32) -> Self {
            Self {
                mark: RefCell::new(mark),
                ..Self::default()
            }
        }
    }

    impl MarkOps for FakeMarkOps {
        fn get_mark(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
            *self.gets.borrow_mut() += 1;
            *self.last_fd.borrow_mut() = Some(fd.as_raw_fd());
            if self.fail_get {
                return Err(io::Error::from_raw_os_error(libc_errno_bad_fd()));
            }
            Ok(*self.mark.borrow())
        }

        fn set_mark(&self, fd: BorrowedFd<'_>, mark: u32) -> io::Result<()> {
            *self.sets.borrow_mut() += 1;
            *self.last_fd.borrow_mut() = Some(fd.as_raw_fd());
            if self.fail_set {
                return Err(io::Error::from_raw_os_error(libc_errno_bad_fd()));
            }
            *self.mark.borrow_mut() = mark;
            Ok(())
        }
    }

    fn libc_errno_bad_fd() -> i32 {
        9 // EBADF
    }

    fn test_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    #[test]
    fn set_fwmark_read_modify_write() {
        let cases = [
            // (initial, value, mask, expected)
            (0x0, 0x0, 0x0, 0x0),
            (0x1, 0x0, 0x0, 0x1),
            (0x1, 0x0, 0x1, 0x0),
            (0xaabbccdd, 0x11223344, 0xf0f0f0f0, 0x1a2b3c4d),
            (0xaabbccdd, 0x11223344, 0xffff0000, 0x1122ccdd),
            (0xaabbccdd, 0x11223344, 0x0000ffff, 0xaabb3344),
            (0xaabbccdd, 0x11223344, 0xffffffff, 0x11223344),
        ];

        let sock = test_socket();
        for (initial, value, mask, expected) in cases {
            let svc = RoutingService::with_ops(FakeMarkOps::with_mark(initial));
            svc.set_fwmark(sock.as_fd(), Fwmark::new(value), Fwmark::new(mask))
                .unwrap();
            assert_eq!(
                expected,
                *svc.ops.mark.borrow(),
                "initial={initial:#010x} value={value:#010x} mask={mask:#010x}",
            );
            assert_eq!(Some(sock.as_raw_fd()), *svc.ops.last_fd.borrow());
        }
    }

    #[test]
    fn set_fwmark_surfaces_syscall_failures() {
        let sock = test_socket();

        let svc = RoutingService::with_ops(FakeMarkOps {
            fail_get: true,
            ..FakeMarkOps::default()
        });
        assert!(matches!(
            svc.set_fwmark(sock.as_fd(), Fwmark::new(0x1), Fwmark::new(0x1)),
            Err(RoutingError::GetMark(_)),
        ));

        let svc = RoutingService::with_ops(FakeMarkOps {
            fail_set: true,
            ..FakeMarkOps::default()
        });
        assert!(matches!(
            svc.set_fwmark(sock.as_fd(), Fwmark::new(0x1), Fwmark::new(0x1)),
            Err(RoutingError::SetMark(_)),
        ));

        let svc = RoutingService::with_ops(FakeMarkOps::default());
        assert!(svc
            .set_fwmark(sock.as_fd(), Fwmark::new(0x1), Fwmark::new(0x1))
            .is_ok());
    }

    #[test]
    fn tag_socket_replaces_vpn_and_routing_fields() {
        let cases: &[(Option<u32>, VpnPolicy, u32, u32)] = &[
            (None, VpnPolicy::RouteOnVpn, 0x0, 0x00008000),
            (None, VpnPolicy::BypassVpn, 0x0, 0x00004000),
            (None, VpnPolicy::RouteOnVpn, 0x1, 0x00008001),
            (Some(1), VpnPolicy::BypassVpn, 0xabcd00ef, 0x03e940ef),
            (None, VpnPolicy::RouteOnVpn, 0x11223344, 0x0000b344),
            (Some(34567), VpnPolicy::BypassVpn, 0x11223344, 0x8aef7344),
            (None, VpnPolicy::RouteOnVpn, 0x00008000, 0x00008000),
            (None, VpnPolicy::BypassVpn, 0x00004000, 0x00004000),
            // A stale opposite policy bit is always replaced, not accumulated.
            (None, VpnPolicy::BypassVpn, 0x00008000, 0x00004000),
            (None, VpnPolicy::RouteOnVpn, 0x00004000, 0x00008000),
            (Some(1), VpnPolicy::Default, 0x00008000, 0x03e90000),
            (Some(12), VpnPolicy::Default, 0x00004000, 0x03f40000),
        ];

        let sock = test_socket();
        for &(network_id, policy, initial, expected) in cases {
            let svc = RoutingService::with_ops(FakeMarkOps::with_mark(initial));
            svc.tag_socket(sock.as_fd(), network_id, policy).unwrap();
            assert_eq!(
                expected,
                *svc.ops.mark.borrow(),
                "network_id={network_id:?} policy={policy:?} initial={initial:#010x}",
            );
            assert_eq!(1, *svc.ops.gets.borrow());
            assert_eq!(1, *svc.ops.sets.borrow());
        }
    }

    #[test]
    fn tag_socket_rejects_route_on_vpn_with_network_id() {
        let sock = test_socket();
        let svc = RoutingService::with_ops(FakeMarkOps::default());
        assert!(matches!(
            svc.tag_socket(sock.as_fd(), Some(123), VpnPolicy::RouteOnVpn),
            Err(RoutingError::VpnWithNetworkId),
        ));
        // The precondition fires before any syscall.
        assert_eq!(0, *svc.ops.gets.borrow());
        assert_eq!(0, *svc.ops.sets.borrow());
    }

    #[test]
    fn tag_socket_surfaces_syscall_failures() {
        let sock = test_socket();

        let svc = RoutingService::with_ops(FakeMarkOps {
            fail_get: true,
            ..FakeMarkOps::default()
        });
        assert!(svc
            .tag_socket(sock.as_fd(), None, VpnPolicy::RouteOnVpn)
            .is_err());

        let svc = RoutingService::with_ops(FakeMarkOps {
            fail_set: true,
            ..FakeMarkOps::default()
        });
        assert!(svc
            .tag_socket(sock.as_fd(), None, VpnPolicy::RouteOnVpn)
            .is_err());
    }

    #[test]
    fn tag_socket_rejects_out_of_range_network_id() {
        let sock = test_socket();
        let svc = RoutingService::with_ops(FakeMarkOps::default());
        assert!(matches!(
            svc.tag_socket(sock.as_fd(), Some(u32::MAX - 100), VpnPolicy::Default),
            Err(RoutingError::NetworkIdOutOfRange(_)),
        ));
        assert_eq!(0, *svc.ops.gets.borrow());
    }
}
