#![forbid(unsafe_code)]

//! Stateless iptables/ip6tables rule generation.
//!
//! Every accept/DNAT/lockdown operation issues a matched pair of opposite
//! rules (insert on add, delete on remove), so the set of active rules is
//! always reconstructible from the (protocol, port, interface) tuples the
//! caller tracks. Rules are applied by handing a full argv to an injected
//! [`CommandRunner`]; nothing here retains state between calls.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

mod runner;

pub use runner::{CommandRunner, SysCommandRunner};

/// Ingress chain accepting inbound connections on opened ports.
const INGRESS_PORT_FIREWALL_CHAIN: &str = "ingress_port_firewall";
/// Ingress chain holding port-forwarding DNAT rules.
const INGRESS_PORT_FORWARDING_CHAIN: &str = "ingress_port_forwarding";
/// Egress chain holding loopback lockdown rules.
const EGRESS_PORT_FIREWALL_CHAIN: &str = "egress_port_firewall";

// Interface names must be shorter than IFNAMSIZ (16 in recent kernels).
const INTERFACE_NAME_SIZE: usize = 16;

/// L4 protocol selector for port rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn command(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("IPv4"),
            IpFamily::V6 => f.write_str("IPv6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Filter,
    Nat,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Insert,
    Append,
    Delete,
}

impl Verb {
    fn flag(self) -> &'static str {
        match self {
            Verb::Insert => "-I",
            Verb::Append => "-A",
            Verb::Delete => "-D",
        }
    }
}

#[derive(Debug, Error)]
pub enum FirewallError {
    /// Validation failure, reported before any command is run.
    #[error("port 0 is not a valid port")]
    InvalidPort,
    /// Validation failure, reported before any command is run.
    #[error("invalid interface name {0:?}")]
    InvalidInterface(String),
    #[error("failed to spawn firewall command")]
    Exec(#[source] io::Error),
    #[error("{family} rule rejected by the firewall command")]
    RuleRejected { family: IpFamily },
}

/// Validates an interface name before it is passed on the iptables command
/// line. Names are restricted to alphanumerics plus embedded `-` and `.`,
/// shorter than IFNAMSIZ.
fn is_valid_interface_name(ifname: &str) -> bool {
    if ifname.is_empty() || ifname.len() >= INTERFACE_NAME_SIZE {
        return false;
    }
    if ifname.starts_with(['-', '.']) || ifname.ends_with(['-', '.']) {
        return false;
    }
    ifname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

pub struct Firewall<R> {
    runner: R,
    /// User whose processes stay allowed through loopback lockdown rules.
    approved_user: String,
}

impl<R: CommandRunner> Firewall<R> {
    pub fn new(runner: R, approved_user: impl Into<String>) -> Self {
        Self {
            runner,
            approved_user: approved_user.into(),
        }
    }

    /// Opens `port` for inbound connections, optionally restricted to
    /// `interface`, for both IPv4 and IPv6.
    ///
    /// All-or-nothing: if the IPv6 rule is rejected the already-applied IPv4
    /// rule is rolled back before the failure is reported.
    pub fn add_accept_rules(
        &self,
        protocol: Protocol,
        port: u16,
        interface: Option<&str>,
    ) -> Result<(), FirewallError> {
        self.validate_port_and_interface(port, interface)?;

        self.modify_accept_rule(IpFamily::V4, Verb::Insert, protocol, port, interface)?;
        if let Err(err) =
            self.modify_accept_rule(IpFamily::V6, Verb::Insert, protocol, port, interface)
        {
            if let Err(rollback) =
                self.modify_accept_rule(IpFamily::V4, Verb::Delete, protocol, port, interface)
            {
                tracing::warn!("failed to roll back IPv4 accept rule: {rollback}");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes the pair of rules installed by [`Firewall::add_accept_rules`].
    ///
    /// Both family deletions run regardless of individual failures; deletion
    /// is idempotent so partial failure is reported but never rolled back.
    pub fn delete_accept_rules(
        &self,
        protocol: Protocol,
        port: u16,
        interface: Option<&str>,
    ) -> Result<(), FirewallError> {
        self.validate_port_and_interface(port, interface)?;

        let v4 = self.modify_accept_rule(IpFamily::V4, Verb::Delete, protocol, port, interface);
        let v6 = self.modify_accept_rule(IpFamily::V6, Verb::Delete, protocol, port, interface);
        v4.and(v6)
    }

    /// Installs a DNAT rule redirecting `port` on `interface` (optionally
    /// restricted to local destination `input_ip`) to `dst_ip:dst_port`,
    /// together with the FORWARD-chain accept rule for the translated
    /// destination.
    ///
    /// DNAT failure aborts before the FORWARD rule is attempted; FORWARD
    /// failure rolls back the DNAT rule.
    pub fn add_ipv4_forward_rule(
        &self,
        protocol: Protocol,
        input_ip: Option<Ipv4Addr>,
        port: u16,
        interface: &str,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), FirewallError> {
        self.modify_dnat_rule(Verb::Insert, protocol, input_ip, port, interface, dst_ip, dst_port)?;
        if let Err(err) =
            self.modify_forward_chain(Verb::Append, protocol, interface, dst_ip, dst_port)
        {
            if let Err(rollback) = self.modify_dnat_rule(
                Verb::Delete,
                protocol,
                input_ip,
                port,
                interface,
                dst_ip,
                dst_port,
            ) {
                tracing::warn!("failed to roll back DNAT rule: {rollback}");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes the pair of rules installed by
    /// [`Firewall::add_ipv4_forward_rule`]. Both deletions run regardless of
    /// individual failures.
    pub fn delete_ipv4_forward_rule(
        &self,
        protocol: Protocol,
        input_ip: Option<Ipv4Addr>,
        port: u16,
        interface: &str,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), FirewallError> {
        let dnat = self.modify_dnat_rule(
            Verb::Delete,
            protocol,
            input_ip,
            port,
            interface,
            dst_ip,
            dst_port,
        );
        let forward = self.modify_forward_chain(Verb::Delete, protocol, interface, dst_ip, dst_port);
        dnat.and(forward)
    }

    /// Rejects loopback connections to `port` from processes not owned by the
    /// approved user, for both IPv4 and IPv6. Same rollback policy as
    /// [`Firewall::add_accept_rules`].
    pub fn add_loopback_lockdown_rules(
        &self,
        protocol: Protocol,
        port: u16,
    ) -> Result<(), FirewallError> {
        if port == 0 {
            return Err(FirewallError::InvalidPort);
        }

        self.modify_lockdown_rule(IpFamily::V4, Verb::Insert, protocol, port)?;
        if let Err(err) = self.modify_lockdown_rule(IpFamily::V6, Verb::Insert, protocol, port) {
            if let Err(rollback) =
                self.modify_lockdown_rule(IpFamily::V4, Verb::Delete, protocol, port)
            {
                tracing::warn!("failed to roll back IPv4 lockdown rule: {rollback}");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes the pair of rules installed by
    /// [`Firewall::add_loopback_lockdown_rules`].
    pub fn delete_loopback_lockdown_rules(
        &self,
        protocol: Protocol,
        port: u16,
    ) -> Result<(), FirewallError> {
        if port == 0 {
            return Err(FirewallError::InvalidPort);
        }

        let v4 = self.modify_lockdown_rule(IpFamily::V4, Verb::Delete, protocol, port);
        let v6 = self.modify_lockdown_rule(IpFamily::V6, Verb::Delete, protocol, port);
        v4.and(v6)
    }

    fn validate_port_and_interface(
        &self,
        port: u16,
        interface: Option<&str>,
    ) -> Result<(), FirewallError> {
        if port == 0 {
            return Err(FirewallError::InvalidPort);
        }
        if let Some(ifname) = interface {
            if !is_valid_interface_name(ifname) {
                return Err(FirewallError::InvalidInterface(ifname.to_string()));
            }
        }
        Ok(())
    }

    fn modify_accept_rule(
        &self,
        family: IpFamily,
        verb: Verb,
        protocol: Protocol,
        port: u16,
        interface: Option<&str>,
    ) -> Result<(), FirewallError> {
        let mut rule = vec![
            "-p".to_string(),
            protocol.name().to_string(),
            "--dport".to_string(),
            port.to_string(),
        ];
        if let Some(ifname) = interface {
            rule.push("-i".to_string());
            rule.push(ifname.to_string());
        }
        rule.push("-j".to_string());
        rule.push("ACCEPT".to_string());

        self.run_iptables(family, Table::Filter, verb, INGRESS_PORT_FIREWALL_CHAIN, rule)
    }

    #[allow(clippy::too_many_arguments)]
    fn modify_dnat_rule(
        &self,
        verb: Verb,
        protocol: Protocol,
        input_ip: Option<Ipv4Addr>,
        port: u16,
        interface: &str,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), FirewallError> {
        if port == 0 || dst_port == 0 {
            return Err(FirewallError::InvalidPort);
        }
        if !is_valid_interface_name(interface) {
            return Err(FirewallError::InvalidInterface(interface.to_string()));
        }

        let mut rule = vec![
            "-i".to_string(),
            interface.to_string(),
            "-p".to_string(),
            protocol.name().to_string(),
        ];
        if let Some(input_ip) = input_ip {
            rule.push("-d".to_string());
            rule.push(input_ip.to_string());
        }
        rule.push("--dport".to_string());
        rule.push(port.to_string());
        rule.push("-j".to_string());
        rule.push("DNAT".to_string());
        rule.push("--to-destination".to_string());
        rule.push(format!("{dst_ip}:{dst_port}"));

        self.run_iptables(IpFamily::V4, Table::Nat, verb, INGRESS_PORT_FORWARDING_CHAIN, rule)
    }

    fn modify_forward_chain(
        &self,
        verb: Verb,
        protocol: Protocol,
        interface: &str,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), FirewallError> {
        if dst_port == 0 {
            return Err(FirewallError::InvalidPort);
        }
        if !is_valid_interface_name(interface) {
            return Err(FirewallError::InvalidInterface(interface.to_string()));
        }

        let rule = vec![
            "-i".to_string(),
            interface.to_string(),
            "-p".to_string(),
            protocol.name().to_string(),
            "-d".to_string(),
            dst_ip.to_string(),
            "--dport".to_string(),
            dst_port.to_string(),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ];

        self.run_iptables(IpFamily::V4, Table::Filter, verb, "FORWARD", rule)
    }

    fn modify_lockdown_rule(
        &self,
        family: IpFamily,
        verb: Verb,
        protocol: Protocol,
        port: u16,
    ) -> Result<(), FirewallError> {
        let rule = vec![
            "-p".to_string(),
            protocol.name().to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-o".to_string(),
            "lo".to_string(),
            "-m".to_string(),
            "owner".to_string(),
            "!".to_string(),
            "--uid-owner".to_string(),
            self.approved_user.clone(),
            "-j".to_string(),
            "REJECT".to_string(),
        ];

        self.run_iptables(family, Table::Filter, verb, EGRESS_PORT_FIREWALL_CHAIN, rule)
    }

    fn run_iptables(
        &self,
        family: IpFamily,
        table: Table,
        verb: Verb,
        chain: &str,
        rule: Vec<String>,
    ) -> Result<(), FirewallError> {
        let mut argv = vec![
            family.command().to_string(),
            "-t".to_string(),
            table.name().to_string(),
            verb.flag().to_string(),
            chain.to_string(),
        ];
        argv.extend(rule);
        // Wait for the xtables lock instead of failing on contention.
        argv.push("-w".to_string());

        let code = self.runner.run(&argv).map_err(FirewallError::Exec)?;
        if code != 0 {
            tracing::warn!(%family, chain, code, "firewall command rejected rule");
            return Err(FirewallError::RuleRejected { family });
        }
        Ok(())
    }
}
