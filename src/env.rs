use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::BridgeConfig;

pub const LISTEN_ADDR_VAR: &str = "BRIDGE_LISTEN_ADDR";
pub const SERVER_ID_VAR: &str = "BRIDGE_SERVER_ID";
pub const CALL_TIMEOUT_VAR: &str = "BRIDGE_CALL_TIMEOUT_MS";
pub const STRICT_PROTOCOL_VAR: &str = "BRIDGE_STRICT_PROTOCOL";
pub const SERVER_ADDR_VAR: &str = "BRIDGE_ADDR";
pub const RECONNECT_ATTEMPTS_VAR: &str = "BRIDGE_RECONNECT_ATTEMPTS";
pub const RECONNECT_DELAY_VAR: &str = "BRIDGE_RECONNECT_DELAY_MS";

/// Settings shared by the peer and trigger clients.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEnv {
    pub server_addr: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

fn default_server_addr() -> String {
    "127.0.0.1:54321".to_string()
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

impl ClientEnv {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(ClientEnv {
            server_addr: lookup(SERVER_ADDR_VAR).unwrap_or_else(default_server_addr),
            reconnect_attempts: match lookup(RECONNECT_ATTEMPTS_VAR) {
                Some(val) => val.parse().with_context(|| format!("{RECONNECT_ATTEMPTS_VAR}={val}"))?,
                None => default_reconnect_attempts(),
            },
            reconnect_delay_ms: match lookup(RECONNECT_DELAY_VAR) {
                Some(val) => val.parse().with_context(|| format!("{RECONNECT_DELAY_VAR}={val}"))?,
                None => default_reconnect_delay_ms(),
            },
        })
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Applies `BRIDGE_*` environment overrides (after reading `.env`) on top of the file config.
pub fn apply_overrides(config: &mut BridgeConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides_from(config, |key| env::var(key).ok())
}

pub fn apply_overrides_from(
    config: &mut BridgeConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(addr) = lookup(LISTEN_ADDR_VAR) {
        config.server.listen_addr = addr;
    }
    if let Some(id) = lookup(SERVER_ID_VAR) {
        config.server.server_id = id;
    }
    if let Some(val) = lookup(CALL_TIMEOUT_VAR) {
        config.calls.call_timeout_ms = val
            .parse()
            .with_context(|| format!("{CALL_TIMEOUT_VAR}={val}"))?;
    }
    if let Some(val) = lookup(STRICT_PROTOCOL_VAR) {
        config.calls.strict_protocol = val
            .parse()
            .with_context(|| format!("{STRICT_PROTOCOL_VAR}={val}"))?;
    }
    config.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn client_defaults() {
        let client = ClientEnv::from_lookup(lookup_in(&[])).unwrap();
        assert_eq!(client.server_addr, "127.0.0.1:54321");
        assert_eq!(client.reconnect_attempts, 10);
        assert_eq!(client.reconnect_delay(), Duration::from_secs(1));
    }

    #[test]
    fn client_values_from_env() {
        let client = ClientEnv::from_lookup(lookup_in(&[
            (SERVER_ADDR_VAR, "10.0.0.2:9000"),
            (RECONNECT_ATTEMPTS_VAR, "3"),
            (RECONNECT_DELAY_VAR, "250"),
        ]))
        .unwrap();
        assert_eq!(client.server_addr, "10.0.0.2:9000");
        assert_eq!(client.reconnect_attempts, 3);
        assert_eq!(client.reconnect_delay_ms, 250);
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = BridgeConfig::default();
        apply_overrides_from(
            &mut config,
            lookup_in(&[
                (LISTEN_ADDR_VAR, "127.0.0.1:6000"),
                (SERVER_ID_VAR, "edge-7"),
                (CALL_TIMEOUT_VAR, "0"),
                (STRICT_PROTOCOL_VAR, "true"),
            ]),
        )
        .unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:6000");
        assert_eq!(config.server.server_id, "edge-7");
        assert_eq!(config.call_timeout(), None);
        assert!(config.calls.strict_protocol);
    }

    #[test]
    fn unparsable_override_is_an_error() {
        let mut config = BridgeConfig::default();
        let result = apply_overrides_from(&mut config, lookup_in(&[(CALL_TIMEOUT_VAR, "soon")]));
        assert!(result.is_err());
    }
}
