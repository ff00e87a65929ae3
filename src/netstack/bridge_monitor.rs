//! Bridge Route Monitor (spec.md §4.9): a fixed-capacity set of
//! monitored subnets, debounced against OS network-path-change
//! notifications, rate-limited to avoid oscillation when a VPN fights
//! back for the route.
//!
//! Structurally grounded on the teacher's job scheduler (interval
//! ticking with a cancellable handle), generalized here from periodic
//! ticking to edge-triggered-with-coalescing.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnet::{Ipv4Net, Ipv6Net};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(8);
const RATE_LIMIT_MAX_EVENTS: usize = 10;

/// Per-subnet state machine (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetState {
    Empty,
    Active,
    GaveUp,
}

/// Tests whether the current route for `subnet` is owned by the
/// bridge; returning `false` triggers `renew`.
pub trait RouteOwnership: Send + Sync {
    fn bridge_owns_route(&self, v4: Ipv4Net, v6: Ipv6Net) -> bool;
}

/// One monitored subnet: an IPv4 prefix, an IPv6 prefix, and a renew
/// closure invoked when the bridge no longer owns the route.
pub struct MonitoredSubnet {
    pub v4: Ipv4Net,
    pub v6: Ipv6Net,
    renew: Box<dyn Fn() + Send + Sync>,
    state: Mutex<SubnetState>,
}

impl MonitoredSubnet {
    pub fn new(v4: Ipv4Net, v6: Ipv6Net, renew: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            v4,
            v6,
            renew: Box::new(renew),
            state: Mutex::new(SubnetState::Empty),
        }
    }

    pub fn state(&self) -> SubnetState {
        *self.state.lock()
    }

    /// `Empty -> Active` on `set`.
    pub fn set(&self) {
        *self.state.lock() = SubnetState::Active;
    }

    /// `Active -> Empty` on `clear`.
    pub fn clear(&self) {
        *self.state.lock() = SubnetState::Empty;
    }

    fn give_up(&self) {
        *self.state.lock() = SubnetState::GaveUp;
    }
}

/// Sliding-window rate limiter: at most `RATE_LIMIT_MAX_EVENTS` events
/// per `RATE_LIMIT_WINDOW`. Not `Send`-shared across await points by
/// design — it is only touched from within the single debounced pass,
/// matching §5's "bounded by `renewMu` — at most one pass runs at a
/// time."
struct RateLimiter {
    events: VecDeque<Instant>,
}

impl RateLimiter {
    fn new() -> Self {
        Self { events: VecDeque::new() }
    }

    /// Records one event and returns whether it's still within budget.
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) > RATE_LIMIT_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() >= RATE_LIMIT_MAX_EVENTS {
            return false;
        }
        self.events.push_back(now);
        true
    }
}

/// Fixed-capacity monitored-subnet array, protected by its own mutex
/// per §5's "a third mutex protects the bridge monitored-subnets."
pub struct BridgeMonitor {
    subnets: Mutex<Vec<Arc<MonitoredSubnet>>>,
    capacity: usize,
    notify: Notify,
    pass_in_flight: AtomicBool,
    rate_limiter: Mutex<RateLimiter>,
}

impl BridgeMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            subnets: Mutex::new(Vec::new()),
            capacity,
            notify: Notify::new(),
            pass_in_flight: AtomicBool::new(false),
            rate_limiter: Mutex::new(RateLimiter::new()),
        }
    }

    pub fn add(&self, subnet: Arc<MonitoredSubnet>) -> Result<(), &'static str> {
        let mut subnets = self.subnets.lock();
        if subnets.len() >= self.capacity {
            return Err("monitored subnet array is full");
        }
        subnets.push(subnet);
        Ok(())
    }

    pub fn clear_all(&self) {
        for subnet in self.subnets.lock().iter() {
            subnet.clear();
        }
    }

    /// Called by the OS network-path-change observer. Debounced:
    /// bursts of notifications within [`DEBOUNCE_WINDOW`] coalesce
    /// into a single pass.
    pub fn notify_path_changed(&self) {
        self.notify.notify_one();
    }

    /// Spawns the debounce+pass loop. Returns a handle whose drop does
    /// not stop the loop; call [`BridgeMonitorHandle::cancel`] to do
    /// that explicitly, mirroring the teacher's `JobHandle`.
    pub fn spawn(self: Arc<Self>, ownership: Arc<dyn RouteOwnership>) -> BridgeMonitorHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let monitor = self.clone();
        let cancelled_task = cancelled.clone();
        tokio::spawn(async move {
            loop {
                monitor.notify.notified().await;
                if cancelled_task.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(DEBOUNCE_WINDOW).await;
                monitor.run_pass(ownership.as_ref());
            }
        });
        BridgeMonitorHandle { cancelled }
    }

    /// Runs one debounced pass: for each active subnet, checks route
    /// ownership and calls `renew` if the bridge no longer owns it. If
    /// the rate limiter rejects, the pass aborts for the remainder of
    /// the cycle and the current subnet transitions to `GaveUp`.
    fn run_pass(&self, ownership: &dyn RouteOwnership) {
        if self.pass_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let _guard = scopeguard::guard((), |_| self.pass_in_flight.store(false, Ordering::SeqCst));

        let subnets = self.subnets.lock().clone();
        for subnet in subnets {
            if subnet.state() != SubnetState::Active {
                continue;
            }
            if ownership.bridge_owns_route(subnet.v4, subnet.v6) {
                continue;
            }

            let mut limiter = self.rate_limiter.lock();
            if !limiter.allow() {
                drop(limiter);
                warn!(v4 = %subnet.v4, "bridge renewal rate limit exceeded, giving up for this cycle");
                subnet.give_up();
                return;
            }
            drop(limiter);

            debug!(v4 = %subnet.v4, v6 = %subnet.v6, "renewing bridge route");
            (subnet.renew)();
        }
    }
}

pub struct BridgeMonitorHandle {
    cancelled: Arc<AtomicBool>,
}

impl BridgeMonitorHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        info!("bridge route monitor stopped");
    }
}

/// Production [`RouteOwnership`]: this stack runs against macOS vmnet
/// bridges (§4.9's "survive VPN on/off" is specifically about macOS
/// route changes), whose routing table has no procfs equivalent and no
/// safe Rust binding in this crate's dependency stack for the BSD
/// routing socket (`PF_ROUTE`/`RTM_GET`). `route get` is the same
/// interface macOS's own network diagnostics tooling uses and is shelled
/// out to here for the same reason `ifconfig`/`netstat`-wrapping daemons
/// do: it is the supported, stable way to ask the kernel "what
/// interface owns this destination" without hand-rolling the routing
/// socket's binary message format.
pub struct SystemRouteOwnership {
    bridge_interface: String,
}

impl SystemRouteOwnership {
    pub fn new(bridge_interface: impl Into<String>) -> Self {
        Self {
            bridge_interface: bridge_interface.into(),
        }
    }
}

impl RouteOwnership for SystemRouteOwnership {
    fn bridge_owns_route(&self, v4: Ipv4Net, v6: Ipv6Net) -> bool {
        route_interface(&v4.network().to_string(), false)
            .map(|iface| iface == self.bridge_interface)
            .unwrap_or(false)
            && route_interface(&v6.network().to_string(), true)
                .map(|iface| iface == self.bridge_interface)
                .unwrap_or(false)
    }
}

/// Runs `route -n get [-inet6] <addr>` and extracts the `interface:`
/// line. Returns `None` if the command fails or the destination has no
/// route at all (an unreachable destination is not "owned" by
/// anything).
fn route_interface(addr: &str, inet6: bool) -> Option<String> {
    let mut cmd = std::process::Command::new("route");
    cmd.arg("-n").arg("get");
    if inet6 {
        cmd.arg("-inet6");
    }
    cmd.arg(addr);
    let output = cmd.output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(rest) = line.trim().strip_prefix("interface:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

pub const RESERVED_BRIDGE_SLOT: usize = 1;

pub fn default_capacity(max_vlan_interfaces: usize) -> usize {
    max_vlan_interfaces + RESERVED_BRIDGE_SLOT
}

#[allow(dead_code)]
fn unused_subnet_placeholder() -> (Ipv4Addr, Ipv6Addr) {
    (Ipv4Addr::UNSPECIFIED, Ipv6Addr::UNSPECIFIED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct AlwaysOwned;
    impl RouteOwnership for AlwaysOwned {
        fn bridge_owns_route(&self, _v4: Ipv4Net, _v6: Ipv6Net) -> bool {
            true
        }
    }

    struct NeverOwned;
    impl RouteOwnership for NeverOwned {
        fn bridge_owns_route(&self, _v4: Ipv4Net, _v6: Ipv6Net) -> bool {
            false
        }
    }

    fn subnet(renew_count: Arc<AtomicU32>) -> Arc<MonitoredSubnet> {
        Arc::new(MonitoredSubnet::new(
            "10.0.0.0/24".parse().unwrap(),
            "fd00::/64".parse().unwrap(),
            move || {
                renew_count.fetch_add(1, Ordering::SeqCst);
            },
        ))
    }

    #[test]
    fn set_and_clear_transitions() {
        let subnet = subnet(Arc::new(AtomicU32::new(0)));
        assert_eq!(subnet.state(), SubnetState::Empty);
        subnet.set();
        assert_eq!(subnet.state(), SubnetState::Active);
        subnet.clear();
        assert_eq!(subnet.state(), SubnetState::Empty);
    }

    #[test]
    fn pass_skips_owned_routes() {
        let monitor = BridgeMonitor::new(4);
        let renew_count = Arc::new(AtomicU32::new(0));
        let s = subnet(renew_count.clone());
        s.set();
        monitor.add(s).unwrap();

        monitor.run_pass(&AlwaysOwned);
        assert_eq!(renew_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pass_renews_unowned_active_subnets() {
        let monitor = BridgeMonitor::new(4);
        let renew_count = Arc::new(AtomicU32::new(0));
        let s = subnet(renew_count.clone());
        s.set();
        monitor.add(s).unwrap();

        monitor.run_pass(&NeverOwned);
        assert_eq!(renew_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pass_ignores_empty_subnets() {
        let monitor = BridgeMonitor::new(4);
        let renew_count = Arc::new(AtomicU32::new(0));
        let s = subnet(renew_count.clone());
        monitor.add(s).unwrap();

        monitor.run_pass(&NeverOwned);
        assert_eq!(renew_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rate_limiter_caps_events_per_window() {
        let mut limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX_EVENTS {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
    }

    #[test]
    fn exceeding_rate_limit_transitions_subnet_to_gave_up() {
        let monitor = BridgeMonitor::new(4);
        let renew_count = Arc::new(AtomicU32::new(0));
        let s = subnet(renew_count);
        s.set();
        monitor.add(s.clone()).unwrap();

        for _ in 0..RATE_LIMIT_MAX_EVENTS {
            assert!(monitor.rate_limiter.lock().allow());
        }

        monitor.run_pass(&NeverOwned);
        assert_eq!(s.state(), SubnetState::GaveUp);
    }

    #[test]
    fn capacity_is_enforced() {
        let monitor = BridgeMonitor::new(1);
        monitor.add(subnet(Arc::new(AtomicU32::new(0)))).unwrap();
        assert!(monitor.add(subnet(Arc::new(AtomicU32::new(0)))).is_err());
    }
}
