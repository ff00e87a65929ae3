//! Serve subcommand: runs the user-space network stack for the
//! lifetime of the process.
//!
//! The virtio-net transport itself (the raw frame source/sink backed
//! by the VMM's vsock or tap device) is an external collaborator, the
//! same way the guest control daemon is for the migrator: this binary
//! owns the stack's TCP/IP and forwarding logic, not the hypervisor
//! plumbing that feeds it frames.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use smoltcp::wire::{EthernetAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tracing::{info, warn};

use vmhost_core::config::Configuration;
use vmhost_core::netstack::bridge_monitor::{default_capacity, BridgeMonitor, MonitoredSubnet, SystemRouteOwnership};
use vmhost_core::netstack::dns_reverse_map::DnsReverseMap;
use vmhost_core::netstack::forwarder::tcp::{translate_host_nat, HostNatAddresses};
use vmhost_core::netstack::host_forwards::{serve_tcp_to_unix, serve_unix_to_stack_tcp};
use vmhost_core::netstack::link::Frame;
use vmhost_core::netstack::proxy::{BypassFilter, ConfigOverride, ProxyDialer, ProxyDialerSet, ProxyKind, SystemProxySettings};
use vmhost_core::netstack::ready_bus::{serve_ready_listener, ReadyBus};
use vmhost_core::netstack::stack::StaticConfig;
use vmhost_core::netstack::{serve, ServeParams};

const FRAME_CHANNEL_CAPACITY: usize = 256;
const DNS_REVERSE_MAP_CAPACITY: usize = 4096;
const MAX_VLAN_INTERFACES: usize = 16;

#[derive(Args, Debug)]
pub struct ServeArgs {}

pub async fn run(_args: ServeArgs, config: &Configuration) -> Result<()> {
    let static_config = build_static_config(config).context("invalid netstack configuration")?;
    let host_nat = HostNatAddresses {
        v4: static_config.gateway_v4,
        v6: static_config.gateway_v6,
    };

    let proxies = Arc::new(build_proxy_dialer_set(config).context("invalid proxy configuration")?);
    let reverse_map = Arc::new(DnsReverseMap::with_capacity(DNS_REVERSE_MAP_CAPACITY));
    let bridge_monitor = Arc::new(BridgeMonitor::new(default_capacity(MAX_VLAN_INTERFACES)));
    let ready_bus = Arc::new(ReadyBus::new());

    spawn_bridge_monitor(&bridge_monitor, config, &static_config);
    spawn_ready_bus_listener(&ready_bus, config).await?;
    spawn_host_forwards(&config.netstack.host_forwards, host_nat).await?;

    let (guest_tx, stack_rx) = tokio::sync::mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
    let (stack_tx, guest_rx) = tokio::sync::mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
    spawn_transport_stub(guest_tx, guest_rx);

    let params = ServeParams {
        rx: stack_rx,
        tx: stack_tx,
        mtu: config.netstack.mtu,
        static_config,
        host_nat,
        proxies,
        reverse_map,
        bridge_monitor,
        ready_bus,
    };

    info!(runtime_dir = %config.netstack.runtime_dir.display(), "starting network stack");
    serve(params).await.context("network stack exited with an error")?;
    Ok(())
}

/// Registers the vnet subnet with the bridge route monitor and spawns
/// its debounced renewal loop, when a bridge interface is configured.
/// With none configured (no vmnet bridge in this deployment) the
/// monitor is left idle: constructed but never driven.
fn spawn_bridge_monitor(bridge_monitor: &Arc<BridgeMonitor>, config: &Configuration, static_config: &StaticConfig) {
    let Some(bridge_interface) = config.netstack.bridge_interface.clone() else {
        return;
    };

    let v4 = match (static_config.vnet_v4.address(), static_config.vnet_v4.prefix_len()) {
        (IpAddress::Ipv4(addr), prefix) => match Ipv4Net::new(Ipv4Addr::from(addr), prefix) {
            Ok(net) => net,
            Err(e) => {
                warn!(error = %e, "failed to build bridge-monitor ipv4 subnet, bridge monitoring disabled");
                return;
            }
        },
        _ => {
            warn!("vnet_v4 is not an IPv4 CIDR, bridge monitoring disabled");
            return;
        }
    };
    let v6 = match (static_config.vnet_v6.address(), static_config.vnet_v6.prefix_len()) {
        (IpAddress::Ipv6(addr), prefix) => match Ipv6Net::new(Ipv6Addr::from(addr), prefix) {
            Ok(net) => net,
            Err(e) => {
                warn!(error = %e, "failed to build bridge-monitor ipv6 subnet, bridge monitoring disabled");
                return;
            }
        },
        _ => {
            warn!("vnet_v6 is not an IPv6 CIDR, bridge monitoring disabled");
            return;
        }
    };

    let renew_interface = bridge_interface.clone();
    let subnet = Arc::new(MonitoredSubnet::new(v4, v6, move || {
        warn!(interface = %renew_interface, "bridge route lost, renewal requested (external vmnet collaborator owns the actual renew)");
    }));
    subnet.set();
    if let Err(e) = bridge_monitor.add(subnet) {
        warn!(error = %e, "failed to register monitored subnet");
        return;
    }

    let ownership = Arc::new(SystemRouteOwnership::new(bridge_interface));
    // The handle's drop does not stop the loop (see BridgeMonitorHandle
    // doc comment); nothing in this process ever needs to cancel it
    // before exit, so the handle itself is not kept.
    bridge_monitor.clone().spawn(ownership);
}

/// Binds the ready-event bus's guest-reachable listener on loopback at
/// the configured port: guest flows aimed at the host-NAT address on
/// this port are translated to loopback by the stack's existing
/// host-NAT path, so no stack-internal listener is needed here.
async fn spawn_ready_bus_listener(ready_bus: &Arc<ReadyBus>, config: &Configuration) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], config.netstack.ready_bus_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind ready-event bus listener on {addr}"))?;
    let bus = ready_bus.clone();
    tokio::spawn(async move {
        serve_ready_listener(listener, bus).await;
    });
    Ok(())
}

enum HostForwardEndpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

fn parse_host_forward_endpoint(s: &str) -> Result<HostForwardEndpoint> {
    if let Some(rest) = s.strip_prefix("tcp:") {
        Ok(HostForwardEndpoint::Tcp(
            rest.parse().with_context(|| format!("invalid tcp host forward endpoint: {rest}"))?,
        ))
    } else if let Some(rest) = s.strip_prefix("unix:") {
        Ok(HostForwardEndpoint::Unix(PathBuf::from(rest)))
    } else {
        anyhow::bail!("host forward endpoint must start with tcp: or unix:: {s}");
    }
}

/// Parses and spawns every configured host forward (spec.md §4.10):
/// `unix:<path>=tcp:<addr>` binds the unix path and dials the stack's
/// host-NAT-translated TCP address per connection; `tcp:<addr>=unix:<path>`
/// binds the TCP address and dials the unix path.
async fn spawn_host_forwards(specs: &[String], host_nat: HostNatAddresses) -> Result<()> {
    for spec in specs {
        let (left, right) = spec.split_once('=').with_context(|| format!("invalid host forward spec: {spec}"))?;
        match (parse_host_forward_endpoint(left)?, parse_host_forward_endpoint(right)?) {
            (HostForwardEndpoint::Tcp(listen), HostForwardEndpoint::Unix(unix_path)) => {
                let listener = TcpListener::bind(listen)
                    .await
                    .with_context(|| format!("failed to bind host forward listener on {listen}"))?;
                info!(%listen, unix_path = %unix_path.display(), "host forward (tcp -> unix) listening");
                tokio::spawn(async move {
                    serve_tcp_to_unix(listener, unix_path).await;
                });
            }
            (HostForwardEndpoint::Unix(unix_path), HostForwardEndpoint::Tcp(stack_addr)) => {
                let _ = std::fs::remove_file(&unix_path);
                let listener = UnixListener::bind(&unix_path)
                    .with_context(|| format!("failed to bind host forward unix socket at {}", unix_path.display()))?;
                info!(unix_path = %unix_path.display(), %stack_addr, "host forward (unix -> stack tcp) listening");
                tokio::spawn(async move {
                    serve_unix_to_stack_tcp(listener, stack_addr, move |addr| {
                        let translated = translate_host_nat(addr, host_nat);
                        let std_stream = std::net::TcpStream::connect(translated)?;
                        std_stream.set_nonblocking(true)?;
                        TcpStream::from_std(std_stream)
                    })
                    .await;
                });
            }
            _ => anyhow::bail!("host forward spec must pair tcp with unix: {spec}"),
        }
    }
    Ok(())
}

/// Stands in for the VMM's virtio-net transport: a real deployment
/// bridges `guest_tx`/`guest_rx` to the hypervisor's vsock/tap frame
/// source, which this codebase does not own.
fn spawn_transport_stub(_guest_tx: tokio::sync::mpsc::Sender<Frame>, mut guest_rx: tokio::sync::mpsc::Receiver<Frame>) {
    tokio::spawn(async move {
        warn!("no virtio-net transport wired up; frames the stack emits are being discarded");
        while guest_rx.recv().await.is_some() {
            // Drained and dropped: the VMM layer is responsible for
            // forwarding these to the guest's virtio-net device.
        }
    });
}

fn build_static_config(config: &Configuration) -> Result<StaticConfig> {
    let ipv4_net: IpNet = config
        .netstack
        .ipv4_subnet
        .parse()
        .with_context(|| format!("invalid ipv4_subnet: {}", config.netstack.ipv4_subnet))?;
    let ipv6_net: IpNet = config
        .netstack
        .ipv6_subnet
        .parse()
        .with_context(|| format!("invalid ipv6_subnet: {}", config.netstack.ipv6_subnet))?;

    let (v4_addr, v4_prefix) = match ipv4_net {
        IpNet::V4(net) => (net.network(), net.prefix_len()),
        IpNet::V6(_) => anyhow::bail!("ipv4_subnet must be an IPv4 CIDR"),
    };
    let (v6_addr, v6_prefix) = match ipv6_net {
        IpNet::V6(net) => (net.network(), net.prefix_len()),
        IpNet::V4(_) => anyhow::bail!("ipv6_subnet must be an IPv6 CIDR"),
    };

    let mut gateway_v4_octets = v4_addr.octets();
    gateway_v4_octets[3] |= 1;
    let gateway_v4 = Ipv4Addr::from(gateway_v4_octets);

    let mut gateway_v6_octets = v6_addr.octets();
    gateway_v6_octets[15] |= 1;
    let gateway_v6 = Ipv6Addr::from(gateway_v6_octets);

    let vnet_v4 = IpCidr::new(IpAddress::Ipv4(Ipv4Address::from(v4_addr)), v4_prefix);
    let vnet_v6 = IpCidr::new(IpAddress::Ipv6(Ipv6Address::from(v6_addr)), v6_prefix);

    Ok(StaticConfig {
        gateway_v4,
        gateway_v6,
        guest_mac: EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x01]),
        vnet_v4,
        vnet_v6,
        host_mac: EthernetAddress([0x52, 0x54, 0x00, 0x00, 0x00, 0x02]),
    })
}

fn build_proxy_dialer_set(config: &Configuration) -> Result<ProxyDialerSet> {
    let override_dialer = match &config.netstack.proxy_override {
        None => ConfigOverride::None,
        Some(url) if url.is_empty() || url == "none" => ConfigOverride::None,
        Some(url) => ConfigOverride::Url(parse_proxy_url(url)?),
    };

    let system = SystemProxySettings {
        socks: if config.netstack.system_socks_enabled {
            Some(ProxyDialer {
                kind: ProxyKind::Socks,
                addr: "127.0.0.1:1080".parse().unwrap(),
            })
        } else {
            None
        },
        https: if config.netstack.system_https_enabled {
            Some(ProxyDialer {
                kind: ProxyKind::Http,
                addr: "127.0.0.1:443".parse().unwrap(),
            })
        } else {
            None
        },
        http: if config.netstack.system_http_enabled {
            Some(ProxyDialer {
                kind: ProxyKind::Http,
                addr: "127.0.0.1:80".parse().unwrap(),
            })
        } else {
            None
        },
    };

    let bypass = BypassFilter::parse(&config.netstack.proxy_bypass).map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(ProxyDialerSet::new(override_dialer, system, bypass))
}

fn parse_proxy_url(url: &str) -> Result<ProxyDialer> {
    let (kind, rest) = if let Some(rest) = url.strip_prefix("socks5://") {
        (ProxyKind::Socks, rest)
    } else if let Some(rest) = url.strip_prefix("socks://") {
        (ProxyKind::Socks, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (ProxyKind::Http, rest)
    } else {
        anyhow::bail!("unsupported proxy scheme in override url: {url}");
    };
    let addr = std::net::SocketAddr::from_str(rest).with_context(|| format!("invalid proxy override address: {rest}"))?;
    Ok(ProxyDialer { kind, addr })
}
