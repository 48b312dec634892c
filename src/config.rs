use anyhow::{bail, Context};

/// Daemon configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Physical interface the relays bind to.
    pub lan_ifname: String,
    pub enable_mdns: bool,
    pub enable_ssdp: bool,
    pub enable_broadcast: bool,
    /// User whose processes stay allowed through loopback lockdown rules.
    pub lockdown_user: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let lan_ifname = lookup("SHUNT_LAN_IFNAME")
            .context("SHUNT_LAN_IFNAME is required")?;
        if lan_ifname.is_empty() {
            bail!("SHUNT_LAN_IFNAME must not be empty");
        }

        Ok(Self {
            lan_ifname,
            enable_mdns: flag(&lookup, "SHUNT_ENABLE_MDNS", true)?,
            enable_ssdp: flag(&lookup, "SHUNT_ENABLE_SSDP", true)?,
            enable_broadcast: flag(&lookup, "SHUNT_ENABLE_BROADCAST", true)?,
            lockdown_user: lookup("SHUNT_LOCKDOWN_USER").unwrap_or_else(|| "shunt".to_string()),
        })
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match lookup(key).as_deref() {
        None | Some("") => Ok(default),
        Some("1") | Some("true") => Ok(true),
        Some("0") | Some("false") => Ok(false),
        Some(other) => bail!("{key} must be a boolean, got {other:?}"),
    }
}
