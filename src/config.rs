// Environment-driven configuration with the defaults the UI expects

use anyhow::{Context, Result};
use std::env;

/// Platform capability, decided once at startup and injected where needed so
/// the rest of the code never branches on the OS.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    /// tcset/tcdel/tcshow work (Linux only).
    pub shaping: bool,
    /// tcpdump scan sessions work (Linux only).
    pub capture: bool,
}

impl Capability {
    pub fn detect() -> Self {
        let linux = cfg!(target_os = "linux");
        Self {
            shaping: linux,
            capture: linux,
        }
    }
}

/// One reverse-proxy mount: requests under `mount` are forwarded to `backend`.
#[derive(Debug, Clone)]
pub struct ProxyMount {
    pub mount: String,
    pub backend: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address for the API server.
    pub listen: String,
    /// "development" proxies unmatched paths to the reactjs dev server.
    pub node_env: String,
    /// host:port of the reactjs dev server.
    pub ui_endpoint: String,
    /// Include IPv4/IPv6 addresses in interface discovery.
    pub iface_ipv4: bool,
    pub iface_ipv6: bool,
    /// The API's own port, excluded from every shaping rule.
    pub api_port: String,
    pub proxies: Vec<ProxyMount>,
}

/// How many PROXY_IDn_* slots we look at.
const PROXY_SLOTS: usize = 8;

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_listen = env_or("API_LISTEN", "2023");

        let mut proxies = Vec::new();
        for id in 0..PROXY_SLOTS {
            let enabled = env_or(&format!("PROXY_ID{id}_ENABLED"), if id == 0 { "on" } else { "" });
            let mount = env_or(&format!("PROXY_ID{id}_MOUNT"), if id == 0 { "/restarter/" } else { "" });
            let backend = env_or(
                &format!("PROXY_ID{id}_BACKEND"),
                if id == 0 { "http://127.0.0.1:2024" } else { "" },
            );

            if enabled != "on" {
                if !mount.is_empty() {
                    log::info!("proxy to {mount} is disabled");
                }
                continue;
            }
            if mount.is_empty() {
                continue;
            }
            reqwest::Url::parse(&backend)
                .with_context(|| format!("parse backend {backend} for #{id} mount {mount}"))?;
            proxies.push(ProxyMount { mount, backend });
        }

        Ok(Self {
            listen: listen_addr(&api_listen),
            node_env: env_or("NODE_ENV", "production"),
            ui_endpoint: format!(
                "{}:{}",
                env_or("UI_HOST", "127.0.0.1"),
                env_or("UI_PORT", "3000")
            ),
            iface_ipv4: parse_switch(&env_or("IFACE_FILTER_IPV4", "true")),
            iface_ipv6: parse_switch(&env_or("IFACE_FILTER_IPV6", "true")),
            api_port: trim_port(&api_listen),
            proxies,
        })
    }

    pub fn address_filter(&self) -> crate::ifaces::AddressFilter {
        crate::ifaces::AddressFilter {
            ipv4: self.iface_ipv4,
            ipv6: self.iface_ipv6,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

/// Everything except the literal "false" enables a switch.
fn parse_switch(value: &str) -> bool {
    value != "false"
}

/// Normalize a listen value to a bindable address: a bare port or ":port"
/// binds on all addresses.
pub fn listen_addr(value: &str) -> String {
    if let Some(port) = value.strip_prefix(':') {
        return format!("0.0.0.0:{port}");
    }
    if !value.contains(':') {
        return format!("0.0.0.0:{value}");
    }
    value.to_string()
}

/// The management port for shaping exclusions: the listen value without any
/// leading colon.
fn trim_port(value: &str) -> String {
    value.trim_matches(':').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_switch() {
        assert!(parse_switch("true"));
        assert!(parse_switch(""));
        assert!(parse_switch("on"));
        assert!(!parse_switch("false"));
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr("2023"), "0.0.0.0:2023");
        assert_eq!(listen_addr(":2023"), "0.0.0.0:2023");
        assert_eq!(listen_addr("127.0.0.1:2023"), "127.0.0.1:2023");
    }

    #[test]
    fn test_trim_port() {
        assert_eq!(trim_port("2023"), "2023");
        assert_eq!(trim_port(":2023"), "2023");
    }
}
