//! Configuration structures and loading.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration for both the migrator CLI and the network
/// stack daemon. Only the section relevant to the subcommand in use is
/// read; the rest may be left at its defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Configuration {
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub migrate: MigrateConfiguration,

    #[serde(default)]
    pub netstack: NetstackConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file. Relative paths inside the
    /// config (docker sockets expressed as paths, not URLs) are resolved
    /// against the config file's parent directory.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "failed to parse configuration")?;

        Ok(config)
    }

    /// Configuration with no file backing, used when neither `--config`
    /// nor a default config file is present: every docker-socket default
    /// is resolved from the environment the way the CLI surface
    /// (external collaborator) would.
    pub fn defaults() -> Self {
        Self::default()
    }
}

/// Migrator-specific configuration: worker pool sizing override and the
/// destination-side sync rendezvous port range.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrateConfiguration {
    /// Override for `clamp(logical_performance_cores - 1, 1, 5)`. `None`
    /// uses the computed default.
    #[serde(default)]
    pub worker_pool_size: Option<usize>,

    /// Destination docker socket (the product's own engine).
    #[serde(default = "default_dest_socket")]
    pub destination_socket: String,

    /// TCP dial timeout for the host-NAT/sync-rendezvous wall clocks, in
    /// seconds. Spec.md §5 fixes these at 30s and 10s respectively; this
    /// field only covers operational overrides for testing.
    #[serde(default = "default_sync_wait_secs")]
    pub sync_wait_secs: u64,
}

impl Default for MigrateConfiguration {
    fn default() -> Self {
        Self {
            worker_pool_size: None,
            destination_socket: default_dest_socket(),
            sync_wait_secs: default_sync_wait_secs(),
        }
    }
}

fn default_dest_socket() -> String {
    "/var/run/docker.sock".into()
}

fn default_sync_wait_secs() -> u64 {
    10
}

/// Network-stack configuration: vnet subnets, MTU, proxy overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct NetstackConfiguration {
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default = "default_ipv4_subnet")]
    pub ipv4_subnet: String,

    #[serde(default = "default_ipv6_subnet")]
    pub ipv6_subnet: String,

    /// Proxy override: "none", a SOCKS URL, or an HTTP(S) URL. Empty
    /// string means "consult the system proxy settings" (external
    /// collaborator; represented here as a plain optional field since
    /// the keychain/system-preferences reader is out of scope).
    #[serde(default)]
    pub proxy_override: Option<String>,

    /// System proxy settings, as read from an external collaborator.
    #[serde(default)]
    pub system_socks_enabled: bool,
    #[serde(default)]
    pub system_http_enabled: bool,
    #[serde(default)]
    pub system_https_enabled: bool,

    /// Comma-separated bypass filter string, spec.md §4.7.
    #[serde(default)]
    pub proxy_bypass: String,

    /// Host-forward listen addresses, `unix:<path>=tcp:<addr>` or the
    /// reverse, one per line.
    #[serde(default)]
    pub host_forwards: Vec<String>,

    /// macOS vmnet bridge interface name (e.g. `bridge100`) the bridge
    /// route monitor watches. `None` disables bridge monitoring, for
    /// deployments with no bridged interface.
    #[serde(default)]
    pub bridge_interface: Option<String>,

    /// Host-NAT port the ready-event bus's guest-reachable listener
    /// binds on loopback, translated from the host-NAT address inside
    /// the synthetic subnet (spec.md §4.10).
    #[serde(default = "default_ready_bus_port")]
    pub ready_bus_port: u16,

    #[serde(default = "default_host_control_dir")]
    pub runtime_dir: PathBuf,
}

impl Default for NetstackConfiguration {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            ipv4_subnet: default_ipv4_subnet(),
            ipv6_subnet: default_ipv6_subnet(),
            proxy_override: None,
            system_socks_enabled: false,
            system_http_enabled: false,
            system_https_enabled: false,
            proxy_bypass: String::new(),
            host_forwards: Vec::new(),
            bridge_interface: None,
            ready_bus_port: default_ready_bus_port(),
            runtime_dir: default_host_control_dir(),
        }
    }
}

fn default_mtu() -> u16 {
    1500
}

fn default_ipv4_subnet() -> String {
    "198.19.249.0/24".into()
}

fn default_ipv6_subnet() -> String {
    "fd07:b51a:cc66::/64".into()
}

fn default_ready_bus_port() -> u16 {
    9999
}

fn default_host_control_dir() -> PathBuf {
    PathBuf::from("/tmp/vmhost")
}

/// Resolve the source docker socket the way the migrator CLI does:
/// explicit `--source` flag first, falling back to OS-specific
/// auto-detection for a foreign Docker install.
pub fn default_source_socket() -> String {
    #[cfg(target_os = "windows")]
    {
        "npipe:////./pipe/docker_engine".into()
    }
    #[cfg(not(target_os = "windows"))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let docker_desktop = std::path::Path::new(&home).join(".docker/run/docker.sock");
            if docker_desktop.exists() {
                return format!("unix://{}", docker_desktop.display());
            }
        }
        "/var/run/docker.sock".into()
    }
}
