use crate::infra::journal::{CycleJournal, JournalEventType, JournaledSource};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::rig::Rig;
use crate::runtime::telemetry;
use std::path::{Path, PathBuf};
use std::sync::{atomic::AtomicBool, atomic::Ordering, Arc};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use wash_io::hal_sysfs::gpio_root;
use wash_io::{
    BoardPins, JobPoller, JobPollerConfig, JobSource, MetricsObserver, RemoteClient, RemoteError,
    ShmStore, SysfsError,
};
use wash_spine::motor::DelayMonitorConfig;
use wash_spine::orchestrator::CycleStats;
use wash_spine::{
    Bus, BusError, Clock, CycleError, CycleOrchestrator, DelayMonitor, EdgeCounter,
    OrchestratorConfig, Program, RelayCommand, RelayDriver, RelayDriverConfig, SensorConfig,
    SensorReader, SharedDelay, SystemClock, Tachometer, TachometerConfig, TimeBase, TriacFiring,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bus unavailable: {0}")]
    Bus(#[from] BusError),
    #[error("GPIO board unavailable: {0}")]
    Board(#[from] SysfsError),
    #[error("job service client: {0}")]
    Remote(#[from] RemoteError),
    #[error("failed to open journal {path}: {source}")]
    Journal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown program `{0}` (expected quick, heavy or heavy_extended_drain)")]
    UnknownProgram(String),
    #[error("cycle halted: {0}")]
    Cycle(#[from] CycleError),
}

pub fn run_from_args() {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return;
    }
    if let Err(err) = run(config) {
        error!(error = %err, "Controller stopped with error");
        eprintln!("wash-plc: {err}");
        std::process::exit(1);
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    if config.dump_bus {
        return dump_bus(&config.shm_root);
    }

    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    telemetry::init();
    let metrics_enabled = config.metrics_addr.is_some();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let timebase = TimeBase::new(Arc::clone(&clock));

    let bus = Bus::new(Arc::new(ShmStore::new(&config.shm_root)));
    bus.bootstrap()?;
    info!(root = %config.shm_root.display(), "Bus ready");

    let journal = init_journal(config.journal_path.as_deref(), timebase)?;
    if let Some(ref journal) = journal {
        let _ = journal.log_event(
            JournalEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "simulate": config.simulate,
                "remote_enabled": config.remote_enabled,
                "metrics_enabled": metrics_enabled,
            }),
        );
    }

    if let Some(ref name) = config.start_program {
        let program = parse_program(name)?;
        bus.set_program_code(program.code())?;
        bus.set_cursor(0.0)?;
        info!(program = program.name(), "Starting cycle locally");
        if let Some(ref journal) = journal {
            let _ = journal.log_event(
                JournalEventType::ProgramRequested,
                serde_json::json!({ "program": program }),
            );
        }
    }

    let remote = init_remote(&config)?;

    let stop = Arc::new(AtomicBool::new(false));
    let counter = Arc::new(EdgeCounter::new());
    let delay = SharedDelay::default();

    let rig = if config.simulate {
        Rig::simulated(Arc::clone(&clock), Arc::clone(&counter), delay.clone())
    } else {
        let pins = BoardPins {
            offset: config.gpio_offset,
            ..BoardPins::default()
        };
        Rig::board(&gpio_root(), pins, Arc::clone(&counter))?
    };

    let mut handles: Vec<(&'static str, thread::JoinHandle<()>)> = Vec::new();

    for (name, feeder) in rig.feeders {
        let stop = Arc::clone(&stop);
        handles.push((name, thread::spawn(move || feeder(&stop))));
    }

    {
        let mut driver = RelayDriver::new(
            rig.relays,
            bus.clone(),
            Arc::clone(&clock),
            RelayDriverConfig::default(),
        );
        let stop = Arc::clone(&stop);
        handles.push(("relays", thread::spawn(move || driver.run(&stop))));
    }

    {
        let mut reader = SensorReader::new(
            rig.level,
            rig.door,
            bus.clone(),
            Arc::clone(&clock),
            SensorConfig::default(),
        );
        let stop = Arc::clone(&stop);
        handles.push(("sensors", thread::spawn(move || reader.run(&stop))));
    }

    {
        let mut tachometer = Tachometer::new(
            Arc::clone(&counter),
            bus.clone(),
            Arc::clone(&clock),
            TachometerConfig::default(),
        );
        let stop = Arc::clone(&stop);
        handles.push(("tachometer", thread::spawn(move || tachometer.run(&stop))));
    }

    {
        let monitor = DelayMonitor::new(
            bus.clone(),
            delay.clone(),
            Arc::clone(&clock),
            DelayMonitorConfig::default(),
        );
        let stop = Arc::clone(&stop);
        handles.push(("delay-monitor", thread::spawn(move || monitor.run(&stop))));
    }

    {
        let mut firing = TriacFiring::new(rig.zero_cross, rig.gate, delay, Arc::clone(&clock));
        let stop = Arc::clone(&stop);
        handles.push(("triac", thread::spawn(move || firing.run(&stop))));
    }

    if let Some(ref client) = remote {
        let source: Box<dyn JobSource> = match journal {
            Some(ref journal) => Box::new(JournaledSource::new(
                Arc::clone(client),
                Arc::clone(journal),
            )),
            None => Box::new(Arc::clone(client)),
        };
        let poller_config = JobPollerConfig {
            interval: config.check_interval(),
            restart_command: config.restart_command.clone(),
        };
        let mut poller = JobPoller::new(source, bus.clone(), Arc::clone(&clock), poller_config);
        let stop = Arc::clone(&stop);
        handles.push(("jobs", thread::spawn(move || poller.run(&stop))));
    }

    if metrics_enabled {
        handles.push((
            "bus-monitor",
            telemetry::start_bus_monitor(bus.clone(), Arc::clone(&stop)),
        ));
    }

    let mut orchestrator = CycleOrchestrator::new(
        bus.clone(),
        Arc::clone(&clock),
        OrchestratorConfig::default(),
    )
    .with_observer(Arc::new(MetricsObserver));
    if let Some(ref client) = remote {
        orchestrator = orchestrator.with_reporter(Arc::clone(client) as _);
    }
    if let Some(ref journal) = journal {
        orchestrator = orchestrator.with_observer(Arc::clone(journal) as _);
    }

    let orchestrator_handle = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let result = orchestrator.run(&stop);
            if result.is_err() {
                // Bring every other loop down so the supervisor sees the exit.
                stop.store(true, Ordering::Relaxed);
            }
            (result, orchestrator.stats().clone())
        })
    };

    info!(simulate = config.simulate, "Washer controller running");

    if let Some(seconds) = config.run_seconds {
        info!(seconds, "Running for limited duration");
        let deadline = Duration::from_secs(seconds);
        let started = clock.now();
        while clock.elapsed_since(started) < deadline && !stop.load(Ordering::Relaxed) {
            clock.sleep(Duration::from_millis(100));
        }
        stop.store(true, Ordering::Relaxed);
    }

    let (result, stats) = match orchestrator_handle.join() {
        Ok(outcome) => outcome,
        Err(_) => {
            error!("Orchestrator thread panicked");
            (Ok(()), CycleStats::default())
        }
    };
    stop.store(true, Ordering::Relaxed);

    for (name, handle) in handles {
        if handle.join().is_err() {
            warn!(thread = name, "Worker thread panicked");
        }
    }

    if let Err(err) = bus.send_relay(RelayCommand::AllOff) {
        warn!(error = %err, "Failed to write final all-off");
    }

    info!(
        steps_completed = stats.steps_completed,
        step_failures = stats.step_failures,
        cycles_finished = stats.cycles_finished,
        leveler_iterations = stats.leveler_iterations,
        "Run complete"
    );

    if let Some(ref journal) = journal {
        let _ = journal.log_event(
            JournalEventType::SystemShutdown,
            serde_json::json!({
                "steps_completed": stats.steps_completed,
                "step_failures": stats.step_failures,
                "cycles_finished": stats.cycles_finished,
                "halted": result.is_err(),
            }),
        );
    }

    result.map_err(AppError::from)
}

fn parse_program(name: &str) -> Result<Program, AppError> {
    Program::ALL
        .into_iter()
        .find(|program| program.name() == name)
        .ok_or_else(|| AppError::UnknownProgram(name.to_string()))
}

fn init_remote(config: &RuntimeConfig) -> Result<Option<Arc<RemoteClient>>, AppError> {
    if !config.remote_enabled {
        info!("Job service disabled");
        return Ok(None);
    }
    match config.remote()? {
        Some(remote) => {
            info!(
                base_url = %remote.base_url,
                hub_id = %remote.hub_id,
                device_id = remote.device_id,
                "Job service configured"
            );
            Ok(Some(Arc::new(RemoteClient::new(remote)?)))
        }
        None => {
            warn!("No job service base URL configured, running locally");
            Ok(None)
        }
    }
}

fn init_journal(path: Option<&Path>, timebase: TimeBase) -> Result<Option<Arc<CycleJournal>>, AppError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let journal = CycleJournal::new(path, timebase).map_err(|source| AppError::Journal {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Cycle journal enabled");
    Ok(Some(Arc::new(journal)))
}

fn dump_bus(root: &Path) -> Result<(), AppError> {
    let bus = Bus::new(Arc::new(ShmStore::new(root)));
    let cells: serde_json::Map<String, serde_json::Value> = bus
        .dump()?
        .into_iter()
        .map(|(cell, value)| (cell.key.to_string(), serde_json::json!(value)))
        .collect();
    println!("{}", serde_json::Value::Object(cells));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_names_resolve() {
        assert_eq!(parse_program("quick").unwrap(), Program::Quick);
        assert_eq!(
            parse_program("heavy_extended_drain").unwrap(),
            Program::HeavyExtendedDrain
        );
        assert!(matches!(
            parse_program("delicate"),
            Err(AppError::UnknownProgram(_))
        ));
    }

    #[test]
    fn dump_reports_every_cell() {
        let dir = tempfile::tempdir().unwrap();
        dump_bus(dir.path()).unwrap();
        let bus = Bus::new(Arc::new(ShmStore::new(dir.path())));
        assert_eq!(bus.dump().unwrap().len(), wash_spine::cells::CATALOGUE.len());
        assert!(dir.path().join("relay_command").exists());
    }
}
