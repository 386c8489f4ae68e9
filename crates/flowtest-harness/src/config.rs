//! Harness configuration and the per-suite test context.
//!
//! Configuration is deserialized from TOML into [`HarnessConfigInput`] and
//! resolved into a [`HarnessConfig`] with concrete durations and defaults.
//! The resolved config travels inside a [`TestContext`] created once per
//! suite run and passed into every fixture and verifier call; there is no
//! process-wide mutable configuration state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use flowtest_session::{SessionFactory, TlsMaterial};

/// Raw configuration as written in a suite's TOML file. All fields
/// optional; missing ones take the built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HarnessConfigInput {
    pub switch_address: Option<String>,
    pub control_host: Option<String>,
    pub control_port: Option<u16>,
    pub capture_directory: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_trust_anchors: Option<PathBuf>,
    pub relaxed_matching: Option<bool>,
    pub default_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub retry_interval_ms: Option<u64>,
    /// Logical port number → OS interface name. TOML table keys are
    /// strings; numeric parsing happens in [`resolve`](Self::resolve).
    pub port_map: BTreeMap<String, String>,
}

impl HarnessConfigInput {
    pub fn resolve(self) -> HarnessConfig {
        let defaults = HarnessConfig::default();
        let mut port_map = BTreeMap::new();
        for (key, interface) in self.port_map {
            match key.parse::<u16>() {
                Ok(port) => {
                    port_map.insert(port, interface);
                }
                Err(_) => tracing::warn!(key, "ignoring non-numeric port_map key"),
            }
        }
        HarnessConfig {
            switch_address: self.switch_address,
            control_host: self.control_host.unwrap_or(defaults.control_host),
            control_port: self.control_port.unwrap_or(defaults.control_port),
            capture_directory: self.capture_directory,
            tls_key: self.tls_key,
            tls_cert: self.tls_cert,
            tls_trust_anchors: self.tls_trust_anchors,
            relaxed_matching: self.relaxed_matching.unwrap_or(defaults.relaxed_matching),
            default_timeout: self
                .default_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_timeout),
            handshake_timeout: self
                .handshake_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.handshake_timeout),
            retry_interval: self
                .retry_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_interval),
            port_map,
        }
    }
}

/// Resolved harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Address of the DUT, when the harness dials out.
    pub switch_address: Option<String>,
    /// Local address/port the control channel binds or announces.
    pub control_host: String,
    pub control_port: u16,
    /// When set, data-plane fixtures capture to `<dir>/<test-id>.pcap`.
    pub capture_directory: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_trust_anchors: Option<PathBuf>,
    /// Relaxed matching: `poll` is constrained to the expected port and
    /// payload shape instead of accepting any packet.
    pub relaxed_matching: bool,
    /// Timeout for individual transactions and polls.
    pub default_timeout: Duration,
    /// Timeout for connection establishment during fixture setup.
    pub handshake_timeout: Duration,
    /// Spacing between statistics polling rounds.
    pub retry_interval: Duration,
    pub port_map: BTreeMap<u16, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            switch_address: None,
            control_host: "127.0.0.1".into(),
            control_port: 6653,
            capture_directory: None,
            tls_key: None,
            tls_cert: None,
            tls_trust_anchors: None,
            relaxed_matching: false,
            default_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(20),
            retry_interval: Duration::from_secs(1),
            port_map: BTreeMap::new(),
        }
    }
}

impl HarnessConfig {
    /// Parse and resolve a TOML configuration document.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<HarnessConfigInput>(text).map(HarnessConfigInput::resolve)
    }

    /// Logical port numbers in ascending order.
    pub fn sorted_ports(&self) -> Vec<u16> {
        self.port_map.keys().copied().collect()
    }

    /// TLS material for the secure variant, present only when all three
    /// paths are configured.
    pub fn tls_material(&self) -> Option<TlsMaterial> {
        match (&self.tls_key, &self.tls_cert, &self.tls_trust_anchors) {
            (Some(key), Some(cert), Some(trust_anchors)) => Some(TlsMaterial {
                key: key.clone(),
                cert: cert.clone(),
                trust_anchors: trust_anchors.clone(),
            }),
            _ => None,
        }
    }
}

/// Everything a test needs, created once per suite run: the resolved
/// configuration plus the collaborator factory fixtures acquire sessions
/// from.
#[derive(Clone)]
pub struct TestContext {
    pub config: HarnessConfig,
    factory: Arc<dyn SessionFactory>,
}

impl TestContext {
    pub fn new(config: HarnessConfig, factory: Arc<dyn SessionFactory>) -> Self {
        TestContext { config, factory }
    }

    pub fn factory(&self) -> &dyn SessionFactory {
        self.factory.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_and_flags() {
        let config = HarnessConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(2));
        assert_eq!(config.handshake_timeout, Duration::from_secs(20));
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert!(!config.relaxed_matching);
    }

    #[test]
    fn toml_round_trip_with_overrides() {
        let config = HarnessConfig::from_toml(
            r#"
            switch_address = "10.0.0.2:6653"
            relaxed_matching = true
            default_timeout_ms = 250
            retry_interval_ms = 10

            [port_map]
            "2" = "veth2"
            "1" = "veth1"
            "#,
        )
        .unwrap();
        assert_eq!(config.switch_address.as_deref(), Some("10.0.0.2:6653"));
        assert!(config.relaxed_matching);
        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert_eq!(config.retry_interval, Duration::from_millis(10));
        assert_eq!(config.sorted_ports(), vec![1, 2]);
        // Unset fields keep their defaults.
        assert_eq!(config.handshake_timeout, Duration::from_secs(20));
    }

    #[test]
    fn tls_material_requires_all_three_paths() {
        let mut config = HarnessConfig::default();
        assert!(config.tls_material().is_none());
        config.tls_key = Some("key.pem".into());
        config.tls_cert = Some("cert.pem".into());
        assert!(config.tls_material().is_none());
        config.tls_trust_anchors = Some("ca.pem".into());
        let tls = config.tls_material().unwrap();
        assert_eq!(tls.key, PathBuf::from("key.pem"));
    }
}
