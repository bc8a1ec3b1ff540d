//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration. File: ~/.config/lp2p/config.toml or /etc/lp2p/config.toml.
/// Env overrides: LP2P_DISCOVERY_PORT, LP2P_TRANSPORT_PORT, LP2P_NICKNAME, LP2P_PSK,
/// LP2P_HANDSHAKE_TIMEOUT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Rendezvous UDP multicast port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Secure transport TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// How often the core's handshake clock advances.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_handshake_timeout_ticks")]
    pub handshake_timeout_ticks: u64,
    #[serde(default = "default_incoming_transport_capacity")]
    pub incoming_transport_capacity: usize,
    /// Nickname `receive` advertises when none is given on the command line.
    #[serde(default)]
    pub nickname: Option<String>,
    /// Shared secret mixed into every session key. Peers must agree on it.
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_handshake_timeout_ticks() -> u64 {
    lp2p_core::config::DEFAULT_HANDSHAKE_TIMEOUT_TICKS
}
fn default_incoming_transport_capacity() -> usize {
    lp2p_core::Config::default().incoming_transport_capacity
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            tick_interval_ms: default_tick_interval_ms(),
            handshake_timeout_ticks: default_handshake_timeout_ticks(),
            incoming_transport_capacity: default_incoming_transport_capacity(),
            nickname: None,
            psk: None,
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Tunables handed to the protocol core.
    pub fn core(&self) -> lp2p_core::Config {
        lp2p_core::Config {
            handshake_timeout_ticks: self.handshake_timeout_ticks,
            incoming_transport_capacity: self.incoming_transport_capacity,
            ..lp2p_core::Config::default()
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn psk_bytes(&self) -> Option<Vec<u8>> {
        self.psk.as_ref().map(|s| s.as_bytes().to_vec())
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<Config> {
    let mut c = match find_file() {
        Some(path) => {
            let text = std::fs::read_to_string(&path)?;
            parse(&text).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?
        }
        None => Config::default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

pub fn parse(text: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(text)
}

/// Apply overrides from `lookup`. Values that do not parse are ignored.
pub fn apply_env(c: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(p) = lookup("LP2P_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
        c.discovery_port = p;
    }
    if let Some(p) = lookup("LP2P_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
        c.transport_port = p;
    }
    if let Some(t) = lookup("LP2P_HANDSHAKE_TIMEOUT").and_then(|s| s.parse().ok()) {
        c.handshake_timeout_ticks = t;
    }
    if let Some(n) = lookup("LP2P_NICKNAME").filter(|s| !s.is_empty()) {
        c.nickname = Some(n);
    }
    if let Some(k) = lookup("LP2P_PSK").filter(|s| !s.is_empty()) {
        c.psk = Some(k);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lp2p/config.toml"));
    }
    out.push(PathBuf::from("/etc/lp2p/config.toml"));
    out
}

fn find_file() -> Option<PathBuf> {
    config_paths().into_iter().find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.discovery_port, 45680);
        assert_eq!(c.transport_port, 45681);
        assert_eq!(c.tick_interval_ms, 1000);
        assert_eq!(c.handshake_timeout_ticks, 30);
        assert_eq!(c.log_format, LogFormat::Text);
        assert!(c.psk.is_none());
    }

    #[test]
    fn file_values_reach_core_config() {
        let c = parse(
            r#"
            transport_port = 5000
            handshake_timeout_ticks = 0
            incoming_transport_capacity = 2
            log_format = "json"
            psk = "1234"
            "#,
        )
        .unwrap();
        assert_eq!(c.transport_port, 5000);
        assert_eq!(c.log_format, LogFormat::Json);
        assert_eq!(c.psk_bytes(), Some(b"1234".to_vec()));
        let core = c.core();
        assert_eq!(core.handshake_timeout_ticks, 0);
        assert_eq!(core.incoming_transport_capacity, 2);
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("LP2P_DISCOVERY_PORT", "1111"),
            ("LP2P_TRANSPORT_PORT", "not-a-port"),
            ("LP2P_NICKNAME", "tv"),
            ("LP2P_PSK", ""),
            ("LP2P_HANDSHAKE_TIMEOUT", "7"),
        ]
        .into_iter()
        .collect();
        let mut c = parse("transport_port = 2222\npsk = \"keep\"").unwrap();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.discovery_port, 1111);
        assert_eq!(c.transport_port, 2222);
        assert_eq!(c.nickname.as_deref(), Some("tv"));
        assert_eq!(c.psk.as_deref(), Some("keep"));
        assert_eq!(c.handshake_timeout_ticks, 7);
    }
}
