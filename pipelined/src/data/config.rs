use anyhow::Result;
use serde::Deserialize;
use slog::{Logger, error, info};
use std::fs;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    // Name of the OVS bridge that pipelined programs.
    pub bridge_name: String,

    // Address of the bridge.  Captive portal traffic is rewritten to this address.
    pub bridge_ip_address: Ipv4Addr,

    // Port the captive portal listens on.
    pub http_port: u16,

    pub nat_iface: String,
    pub enodeb_iface: String,

    // Switch port numbers for the SGi side and the GTP tunnel side.
    pub uplink_port: u32,
    pub gtp_port: u32,

    // Switch port of the header enrichment proxy.
    pub proxy_port: u32,

    // Whether the switch is wiped at startup rather than reconciled.
    pub clean_restart: bool,

    // Apps registered after the classifier, in pipeline order.
    pub static_apps: Vec<String>,
    pub dynamic_apps: Vec<String>,

    // Every RPC is answered within this time.
    pub rpc_timeout_ms: u64,

    pub barrier_timeout_ms: u64,
    pub barrier_retries: u32,

    pub enforcement: EnforcementConfig,
    pub redirect: RedirectConfig,
    pub qos: QosConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bridge_name: "gtp_br0".to_string(),
            bridge_ip_address: Ipv4Addr::new(192, 168, 128, 1),
            http_port: 80,
            nat_iface: "eth2".to_string(),
            enodeb_iface: "eth1".to_string(),
            uplink_port: 2,
            gtp_port: 32768,
            proxy_port: 15,
            clean_restart: true,
            static_apps: vec![
                "ue_mac".to_string(),
                "check_quota".to_string(),
                "he".to_string(),
            ],
            dynamic_apps: vec![
                "gy".to_string(),
                "enforcement".to_string(),
                "enforcement_stats".to_string(),
            ],
            rpc_timeout_ms: 6000,
            barrier_timeout_ms: 1000,
            barrier_retries: 2,
            enforcement: EnforcementConfig::default(),
            redirect: RedirectConfig::default(),
            qos: QosConfig::default(),
        }
    }
}

impl Config {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub poll_interval_secs: u64,
    pub stats_reply_timeout_ms: u64,
}

impl EnforcementConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stats_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_reply_timeout_ms)
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        EnforcementConfig {
            poll_interval_secs: 5,
            stats_reply_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub dns_timeout_ms: u64,
    pub dns_cache_ttl_secs: u64,
}

impl RedirectConfig {
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn dns_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_cache_ttl_secs)
    }
}

impl Default for RedirectConfig {
    fn default() -> Self {
        RedirectConfig {
            dns_timeout_ms: 1500,
            dns_cache_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosImpl {
    LinuxTc,
    OvsMeter,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IdRange {
    pub min_idx: u32,
    pub max_idx: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub enable: bool,
    #[serde(rename = "impl")]
    pub qos_impl: QosImpl,
    // Ceiling applied when a rule carries no MBR.
    pub max_rate: u64,
    pub linux_tc: IdRange,
    pub ovs_meter: IdRange,
}

impl Default for QosConfig {
    fn default() -> Self {
        QosConfig {
            enable: true,
            qos_impl: QosImpl::OvsMeter,
            max_rate: 1_000_000_000,
            linux_tc: IdRange {
                min_idx: 2,
                max_idx: 65534,
            },
            ovs_meter: IdRange {
                min_idx: 2,
                max_idx: 100_000,
            },
        }
    }
}

/// Load the pipelined config from a TOML file.  Missing keys take their defaults.
pub fn load_config_file(filename: &str, logger: &Logger) -> Result<Config> {
    let path = std::env::current_dir()?;
    let contents = fs::read_to_string(filename).inspect_err(|e| {
        error!(
            logger,
            "Failed to load config file {filename} (current directory {}) with error code {e}",
            path.display()
        )
    })?;
    let config: Config = toml::from_str(&contents)?;
    info!(
        logger,
        "Loaded config from {filename}: bridge {} apps {:?} {:?}",
        config.bridge_name,
        config.static_apps,
        config.dynamic_apps
    );
    Ok(config)
}
