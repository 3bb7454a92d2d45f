//! Prometheus metrics for the washer controller.
//!
//! Every bus cell is mirrored into a gauge named after the cell, and the
//! orchestrator's events feed a handful of counters.

use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;
use tiny_http::{Response, Server};
use wash_spine::cells::{Cell, CATALOGUE};
use wash_spine::{Bus, CycleEvent, CycleObserver, LevelerOutcome};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static READY: AtomicBool = AtomicBool::new(false);

// ============================================================================
// Bus Cells
// ============================================================================

/// One gauge per catalogue cell, in catalogue order.
pub static CELL_GAUGES: LazyLock<Vec<(Cell, Gauge)>> = LazyLock::new(|| {
    CATALOGUE
        .iter()
        .map(|cell| {
            let gauge = Gauge::new(cell.metric, format!("Value of bus cell {}", cell.key)).unwrap();
            REGISTRY.register(Box::new(gauge.clone())).unwrap();
            (*cell, gauge)
        })
        .collect()
});

// ============================================================================
// Cycle Metrics
// ============================================================================

/// Program steps completed
pub static STEPS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("washer_steps_completed_total", "Program steps completed").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Program step attempts that failed
pub static STEP_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "washer_step_failures_total",
        "Program step attempts that failed and were retried",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Steps abandoned because the cursor moved or shutdown was requested
pub static STEPS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "washer_steps_aborted_total",
        "Program steps abandoned on cancellation or external cursor change",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Wash cycles run to completion
pub static CYCLES_FINISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("washer_cycles_finished_total", "Wash cycles run to completion").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Speed Control Metrics
// ============================================================================

/// Delay adjustments made by the speed leveler
pub static LEVELER_ITERATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "washer_leveler_iterations_total",
        "Firing delay adjustments made while levelling drum speed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Levelling runs that hit their deadline
pub static LEVELER_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "washer_leveler_timeouts_total",
        "Levelling runs that did not reach the dead band in time",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Job Service Metrics
// ============================================================================

/// Job checks that failed (network, status or parse)
pub static JOB_POLL_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "washer_job_poll_failures_total",
        "Job service checks that failed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Feeds orchestrator events into the counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl CycleObserver for MetricsObserver {
    fn on_event(&self, event: &CycleEvent) {
        match event {
            CycleEvent::StepCompleted { .. } => STEPS_COMPLETED.inc(),
            CycleEvent::StepFailed { .. } => STEP_FAILURES.inc(),
            CycleEvent::StepAborted { .. } => STEPS_ABORTED.inc(),
            CycleEvent::CycleFinished { .. } => CYCLES_FINISHED.inc(),
            CycleEvent::Levelled { outcome, .. } => {
                LEVELER_ITERATIONS.inc_by(u64::from(outcome.iterations()));
                if matches!(outcome, LevelerOutcome::TimedOut { .. }) {
                    LEVELER_TIMEOUTS.inc();
                }
            }
            CycleEvent::StepStarted { .. } => {}
        }
    }
}

/// Copies every cell into its gauge.
pub fn update_cell_gauges(bus: &Bus) {
    for (cell, gauge) in CELL_GAUGES.iter() {
        match bus.read(*cell) {
            Ok(value) => gauge.set(f64::from(value)),
            Err(err) => tracing::debug!(cell = cell.key, error = %err, "Cell read failed"),
        }
    }
}

/// Periodically mirrors the bus into the gauges until `stop` is set.
pub fn spawn_bus_monitor(
    bus: Bus,
    interval: Duration,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            update_cell_gauges(&bus);
            thread::sleep(interval);
        }
    })
}

/// Marks the controller ready once the bus is bootstrapped.
pub fn mark_ready() {
    READY.store(true, Ordering::Relaxed);
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let response = Response::from_data(buffer).with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        )
                        .unwrap(),
                    );
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    if READY.load(Ordering::Relaxed) {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = CELL_GAUGES.len();
    let _ = STEPS_COMPLETED.get();
    let _ = STEP_FAILURES.get();
    let _ = STEPS_ABORTED.get();
    let _ = CYCLES_FINISHED.get();
    let _ = LEVELER_ITERATIONS.get();
    let _ = LEVELER_TIMEOUTS.get();
    let _ = JOB_POLL_FAILURES.get();
}
