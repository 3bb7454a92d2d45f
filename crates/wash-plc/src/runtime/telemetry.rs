use std::sync::{atomic::AtomicBool, Arc};
use std::thread;
use std::time::Duration;
use tracing::info;
use wash_io::metrics::{init_metrics, mark_ready, serve_metrics, spawn_bus_monitor};
use wash_spine::Bus;

const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Mirrors the bus into the cell gauges and flips `/ready`.
pub fn start_bus_monitor(bus: Bus, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    mark_ready();
    spawn_bus_monitor(bus, MONITOR_INTERVAL, stop)
}
