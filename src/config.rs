use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// explicit destinations for search requests; entries without a port use `broadcast_port`
    pub address_list: Vec<SocketAddr>,
    /// add the local broadcast address to the search destinations
    pub auto_address_list: bool,
    pub broadcast_port: u16,
    pub server_port: u16,

    /// upper bound for establishing a TCP connection including the validation handshake
    pub connection_timeout: Duration,
    pub request_timeout: Duration,

    /// base tick of the search timer - back-off for unresolved channels is counted in ticks
    pub search_period: Duration,
    pub search_backoff_initial_ticks: u32,
    pub search_backoff_max_ticks: u32,
    /// growth factor of the gap between searches, in eighths (16 doubles the gap)
    pub search_backoff_factor_eighths: u32,

    /// 0 is quiet; payload dumps are logged from [crate::dispatch::dispatcher::DUMP_DEBUG_LEVEL] up
    pub debug_level: u8,

    pub max_message_size: u32,
    pub receive_buffer_size: u32,
    pub introspection_registry_size: u16,
    /// number of outgoing messages a TCP transport queues before senders have to wait
    pub send_queue_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextConfig {
    pub const DEFAULT_BROADCAST_PORT: u16 = 5076;
    pub const DEFAULT_SERVER_PORT: u16 = 5075;

    pub fn new() -> ContextConfig {
        ContextConfig {
            address_list: Vec::new(),
            auto_address_list: true,
            broadcast_port: Self::DEFAULT_BROADCAST_PORT,
            server_port: Self::DEFAULT_SERVER_PORT,
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            search_period: Duration::from_millis(100),
            search_backoff_initial_ticks: 1,
            search_backoff_max_ticks: 300,
            search_backoff_factor_eighths: 16,
            debug_level: 0,
            max_message_size: 16 * 1024 * 1024,
            receive_buffer_size: 87_380,
            introspection_registry_size: 0x7fff,
            send_queue_size: 1024,
        }
    }

    pub fn from_env() -> anyhow::Result<ContextConfig> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the `EPICS_PVA_*` settings through `lookup`, falling back to defaults for
    ///  variables that are not set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<ContextConfig> {
        let mut config = ContextConfig::new();

        if let Some(port) = lookup("EPICS_PVA_BROADCAST_PORT") {
            config.broadcast_port = parse_value("EPICS_PVA_BROADCAST_PORT", &port)?;
        }
        if let Some(port) = lookup("EPICS_PVA_SERVER_PORT") {
            config.server_port = parse_value("EPICS_PVA_SERVER_PORT", &port)?;
        }
        if let Some(auto) = lookup("EPICS_PVA_AUTO_ADDR_LIST") {
            config.auto_address_list = parse_yes_no("EPICS_PVA_AUTO_ADDR_LIST", &auto)?;
        }
        if let Some(list) = lookup("EPICS_PVA_ADDR_LIST") {
            config.address_list = parse_address_list(&list, config.broadcast_port)?;
        }
        if let Some(tmo) = lookup("EPICS_PVA_CONN_TMO") {
            let secs: f64 = parse_value("EPICS_PVA_CONN_TMO", &tmo)?;
            config.connection_timeout = Duration::try_from_secs_f64(secs)
                .map_err(|e| anyhow!("EPICS_PVA_CONN_TMO: {}", e))?;
        }
        if let Some(level) = lookup("EPICS_PVA_DEBUG") {
            config.debug_level = parse_value("EPICS_PVA_DEBUG", &level)?;
        }

        config.validate()?;
        debug!(?config, "read configuration from environment");
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connection_timeout.is_zero() {
            bail!("connection timeout must be positive");
        }
        if self.search_period.is_zero() {
            bail!("search period must be positive");
        }
        if self.search_backoff_initial_ticks == 0 {
            bail!("search back-off must start at one tick or more");
        }
        if self.search_backoff_factor_eighths < 8 {
            bail!("search back-off factor must be at least 8 eighths");
        }
        if (self.max_message_size as usize) < 1024 {
            bail!("max message size is too small");
        }
        if self.send_queue_size == 0 {
            bail!("send queue size must be positive");
        }
        Ok(())
    }

    /// All destinations search requests go to
    pub fn search_destinations(&self) -> Vec<SocketAddr> {
        let mut result = self.address_list.clone();
        if self.auto_address_list {
            let broadcast = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, self.broadcast_port));
            if !result.contains(&broadcast) {
                result.push(broadcast);
            }
        }
        result
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> anyhow::Result<T>
where T::Err: std::fmt::Display
{
    raw.trim().parse::<T>()
        .map_err(|e| anyhow!("invalid value {:?} for {}: {}", raw, key, e))
}

fn parse_yes_no(key: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(anyhow!("invalid value {:?} for {}: expected YES or NO", raw, key)),
    }
}

/// whitespace separated list of `host[:port]` entries
fn parse_address_list(raw: &str, default_port: u16) -> anyhow::Result<Vec<SocketAddr>> {
    let mut result = Vec::new();
    for entry in raw.split_whitespace() {
        let resolved = if entry.contains(':') {
            entry.to_socket_addrs()
        }
        else {
            (entry, default_port).to_socket_addrs()
        };

        let resolved = resolved
            .map_err(|e| anyhow!("invalid entry {:?} in EPICS_PVA_ADDR_LIST: {}", entry, e))?;
        result.extend(resolved);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rustc_hash::FxHashMap;

    use super::*;

    fn lookup_from(entries: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = entries.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ContextConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.broadcast_port, 5076);
        assert_eq!(config.server_port, 5075);
        assert!(config.auto_address_list);
        assert_eq!(config.search_destinations(), vec![SocketAddr::from(([255, 255, 255, 255], 5076))]);
    }

    #[test]
    fn test_from_lookup() {
        let config = ContextConfig::from_lookup(lookup_from(&[
            ("EPICS_PVA_ADDR_LIST", "10.0.0.1 10.0.0.2:6000"),
            ("EPICS_PVA_AUTO_ADDR_LIST", "NO"),
            ("EPICS_PVA_BROADCAST_PORT", "5999"),
            ("EPICS_PVA_CONN_TMO", "2.5"),
            ("EPICS_PVA_DEBUG", "3"),
        ])).unwrap();

        assert_eq!(config.search_destinations(), vec![
            SocketAddr::from(([10, 0, 0, 1], 5999)),
            SocketAddr::from(([10, 0, 0, 2], 6000)),
        ]);
        assert_eq!(config.connection_timeout, Duration::from_millis(2500));
        assert_eq!(config.debug_level, 3);
    }

    #[rstest]
    #[case::port("EPICS_PVA_BROADCAST_PORT", "99999")]
    #[case::auto("EPICS_PVA_AUTO_ADDR_LIST", "maybe")]
    #[case::tmo_negative("EPICS_PVA_CONN_TMO", "-1")]
    #[case::tmo_zero("EPICS_PVA_CONN_TMO", "0")]
    #[case::debug("EPICS_PVA_DEBUG", "loud")]
    fn test_invalid_values(#[case] key: &str, #[case] value: &str) {
        assert!(ContextConfig::from_lookup(lookup_from(&[(key, value)])).is_err());
    }
}
