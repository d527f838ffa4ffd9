//! Configuration types for the aliasing engine

use std::net::Ipv4Addr;

use bitflags::bitflags;
use serde::Deserialize;

use crate::error::AliasError;

bitflags! {
    /// Engine mode flags, changed at runtime with `PacketAlias::set_mode`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Mode: u32 {
        /// Emit link statistics on every link creation and deletion
        const LOG = 0x01;
        /// Never create links for unsolicited inbound packets
        const DENY_INCOMING = 0x02;
        /// Try to keep the source port as the alias port
        const SAME_PORTS = 0x04;
        /// Reserve a real host socket for partially specified links
        const USE_SOCKETS = 0x08;
        /// Only alias packets coming from RFC 1918 sources
        const UNREGISTERED_ONLY = 0x10;
        /// Flush every link when the default alias address changes
        const RESET_ON_ADDR_CHANGE = 0x20;
        /// Leave generic protocols and GRE untouched, never create inbound TCP links
        const PROXY_ONLY = 0x40;
    }
}

/// Link expiration times, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub icmp: u64,
    pub udp: u64,
    pub proto: u64,
    pub fragment_id: u64,
    pub fragment_ptr: u64,
    /// TCP link that has not seen both sides connect yet
    pub tcp_initial: u64,
    /// Both directions connected
    pub tcp_connected: u64,
    /// One direction closed, the other still connected
    pub tcp_single_dead: u64,
    /// Both directions closed or never connected
    pub tcp_dead: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            icmp: 60,
            udp: 60,
            proto: 60,
            fragment_id: 10,
            fragment_ptr: 30,
            tcp_initial: 90,
            tcp_connected: 86400,
            tcp_single_dead: 90,
            tcp_dead: 10,
        }
    }
}

/// Aliasing engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AliasConfig {
    /// Default alias address, `0.0.0.0` until known
    pub alias_address: Ipv4Addr,
    /// Destination for unmatched inbound flows
    pub target_address: Ipv4Addr,
    pub log: bool,
    pub deny_incoming: bool,
    pub same_ports: bool,
    pub use_sockets: bool,
    pub unregistered_only: bool,
    pub proxy_only: bool,
    pub reset_on_addr_change: bool,
    pub timeouts: Timeouts,
    pub out_table_size: usize,
    pub in_table_size: usize,
    pub max_links: usize,
    pub port_attempts: usize,
    pub cleanup_interval_secs: u64,
    pub cleanup_max_spokes: usize,
    /// Fixed seed for alias port selection; entropy when unset
    pub rng_seed: Option<u64>,
}

impl Default for AliasConfig {
    fn default() -> Self {
        Self {
            alias_address: Ipv4Addr::UNSPECIFIED,
            target_address: Ipv4Addr::UNSPECIFIED,
            log: false,
            deny_incoming: false,
            same_ports: true,
            use_sockets: false,
            unregistered_only: false,
            proxy_only: false,
            reset_on_addr_change: true,
            timeouts: Timeouts::default(),
            out_table_size: 101,
            in_table_size: 4001,
            max_links: 65536,
            port_attempts: 20,
            cleanup_interval_secs: 60,
            cleanup_max_spokes: 30,
            rng_seed: None,
        }
    }
}

impl AliasConfig {
    pub fn new(alias_address: Ipv4Addr) -> Self {
        Self {
            alias_address,
            ..Default::default()
        }
    }

    /// Replace the mode booleans with the given flag set
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.log = mode.contains(Mode::LOG);
        self.deny_incoming = mode.contains(Mode::DENY_INCOMING);
        self.same_ports = mode.contains(Mode::SAME_PORTS);
        self.use_sockets = mode.contains(Mode::USE_SOCKETS);
        self.unregistered_only = mode.contains(Mode::UNREGISTERED_ONLY);
        self.reset_on_addr_change = mode.contains(Mode::RESET_ON_ADDR_CHANGE);
        self.proxy_only = mode.contains(Mode::PROXY_ONLY);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// The mode flags described by this configuration
    pub fn mode(&self) -> Mode {
        let mut mode = Mode::empty();
        mode.set(Mode::LOG, self.log);
        mode.set(Mode::DENY_INCOMING, self.deny_incoming);
        mode.set(Mode::SAME_PORTS, self.same_ports);
        mode.set(Mode::USE_SOCKETS, self.use_sockets);
        mode.set(Mode::UNREGISTERED_ONLY, self.unregistered_only);
        mode.set(Mode::RESET_ON_ADDR_CHANGE, self.reset_on_addr_change);
        mode.set(Mode::PROXY_ONLY, self.proxy_only);
        mode
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(text: &str) -> Result<Self, AliasError> {
        let config: Self = toml::from_str(text).map_err(|e| AliasError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AliasError> {
        if self.out_table_size == 0 || self.in_table_size == 0 {
            return Err(AliasError::Config("link table sizes must be non-zero".into()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(AliasError::Config("cleanup interval must be non-zero".into()));
        }
        if self.port_attempts == 0 {
            return Err(AliasError::Config("port attempts must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_config_default() {
        let config = AliasConfig::default();
        assert_eq!(config.alias_address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.out_table_size, 101);
        assert_eq!(config.in_table_size, 4001);
        assert_eq!(config.mode(), Mode::SAME_PORTS | Mode::RESET_ON_ADDR_CHANGE);
    }

    #[test]
    fn test_mode_roundtrip() {
        let mode = Mode::DENY_INCOMING | Mode::USE_SOCKETS | Mode::LOG;
        let config = AliasConfig::new(Ipv4Addr::new(203, 0, 113, 9)).with_mode(mode);
        assert_eq!(config.mode(), mode);
        assert!(!config.same_ports);
    }

    #[test]
    fn test_from_toml() {
        let config = AliasConfig::from_toml_str(
            r#"
alias_address = "203.0.113.9"
deny_incoming = true
rng_seed = 7

[timeouts]
udp = 30
"#,
        )
        .unwrap();
        assert_eq!(config.alias_address, Ipv4Addr::new(203, 0, 113, 9));
        assert!(config.deny_incoming);
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.timeouts.udp, 30);
        assert_eq!(config.timeouts.icmp, 60);
    }

    #[test]
    fn test_from_toml_rejects_zero_table() {
        let result = AliasConfig::from_toml_str("out_table_size = 0");
        assert!(result.is_err());
    }
}
