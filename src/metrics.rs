use std::fmt::Write as _;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    // Proxies
    pub proxies_registered_total: AtomicU64,
    pub proxies_unregistered_total: AtomicU64,

    // Direct channel
    pub direct_delivered_total: AtomicU64,
    pub direct_dropped_total: AtomicU64,
    pub direct_misrouted_total: AtomicU64,

    // Outbound
    pub bridge_dispatch_total: AtomicU64,
    pub cache_broadcast_failures_total: AtomicU64,

    // Cluster health
    pub protocol_errors_total: AtomicU64,
    pub heartbeat_failures_total: AtomicU64,
    pub instances_reaped_total: AtomicU64,
    pub reconciliations_total: AtomicU64,
    pub listener_reconnects_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            proxies_registered_total: AtomicU64::new(0),
            proxies_unregistered_total: AtomicU64::new(0),
            direct_delivered_total: AtomicU64::new(0),
            direct_dropped_total: AtomicU64::new(0),
            direct_misrouted_total: AtomicU64::new(0),
            bridge_dispatch_total: AtomicU64::new(0),
            cache_broadcast_failures_total: AtomicU64::new(0),
            protocol_errors_total: AtomicU64::new(0),
            heartbeat_failures_total: AtomicU64::new(0),
            instances_reaped_total: AtomicU64::new(0),
            reconciliations_total: AtomicU64::new(0),
            listener_reconnects_total: AtomicU64::new(0),
        }
    }
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}

pub fn render_prometheus() -> String {
    let m = metrics();
    let mut s = String::new();
    for (name, value) in [
        ("rillcast_proxies_registered_total", &m.proxies_registered_total),
        ("rillcast_proxies_unregistered_total", &m.proxies_unregistered_total),
        ("rillcast_direct_delivered_total", &m.direct_delivered_total),
        ("rillcast_direct_dropped_total", &m.direct_dropped_total),
        ("rillcast_direct_misrouted_total", &m.direct_misrouted_total),
        ("rillcast_bridge_dispatch_total", &m.bridge_dispatch_total),
        (
            "rillcast_cache_broadcast_failures_total",
            &m.cache_broadcast_failures_total,
        ),
        ("rillcast_protocol_errors_total", &m.protocol_errors_total),
        ("rillcast_heartbeat_failures_total", &m.heartbeat_failures_total),
        ("rillcast_instances_reaped_total", &m.instances_reaped_total),
        ("rillcast_reconciliations_total", &m.reconciliations_total),
        ("rillcast_listener_reconnects_total", &m.listener_reconnects_total),
    ] {
        let _ = writeln!(
            s,
            "# TYPE {name} counter\n{name} {}",
            value.load(Ordering::Relaxed)
        );
    }
    s
}
