//! Job poller: mirrors the remote job status onto the bus.

use crate::metrics;
use crate::remote::{JobStatus, RemoteClient, RemoteError};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wash_spine::{Bus, BusError, Clock, IDLE_CURSOR};

pub const ENV_CHECK_INTERVAL: &str = "CHECK_INTERVAL";

/// Anything that can tell the poller what job is pending.
pub trait JobSource: Send + Sync {
    fn check_jobs(&self) -> Result<JobStatus, RemoteError>;
}

impl JobSource for RemoteClient {
    fn check_jobs(&self) -> Result<JobStatus, RemoteError> {
        RemoteClient::check_jobs(self)
    }
}

impl<S: JobSource + ?Sized> JobSource for Arc<S> {
    fn check_jobs(&self) -> Result<JobStatus, RemoteError> {
        (**self).check_jobs()
    }
}

impl<S: JobSource + ?Sized> JobSource for Box<S> {
    fn check_jobs(&self) -> Result<JobStatus, RemoteError> {
        (**self).check_jobs()
    }
}

#[derive(Debug, Clone)]
pub struct JobPollerConfig {
    pub interval: Duration,
    /// Run when the service cancels a cycle the controller is still running.
    pub restart_command: Option<Vec<String>>,
}

impl Default for JobPollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            restart_command: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollOutcome {
    Unreachable,
    Unchanged,
    Changed { cursor: f32 },
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollStats {
    pub polls: u64,
    pub failures: u64,
    pub changes: u64,
    pub restarts: u64,
}

pub struct JobPoller<S> {
    source: S,
    bus: Bus,
    clock: Arc<dyn Clock>,
    config: JobPollerConfig,
    last_seen: Option<u32>,
    stats: PollStats,
}

impl<S: JobSource> JobPoller<S> {
    pub fn new(source: S, bus: Bus, clock: Arc<dyn Clock>, config: JobPollerConfig) -> Self {
        Self {
            source,
            bus,
            clock,
            config,
            last_seen: None,
            stats: PollStats::default(),
        }
    }

    pub fn stats(&self) -> PollStats {
        self.stats
    }

    /// One poll. Network and parse failures are swallowed; only bus failures
    /// are returned.
    pub fn poll_once(&mut self) -> Result<PollOutcome, BusError> {
        self.stats.polls += 1;
        let status = match self.source.check_jobs() {
            Ok(status) => status,
            Err(err) => {
                self.stats.failures += 1;
                metrics::JOB_POLL_FAILURES.inc();
                debug!(error = %err, "Job check failed");
                return Ok(PollOutcome::Unreachable);
            }
        };

        if let Some(mode) = status.mode {
            self.bus.set_program_code(mode)?;
        }

        // Writing only on change keeps a stale server status from rewinding
        // the cursor the orchestrator has since advanced.
        if self.last_seen == Some(status.cursor.to_bits()) {
            return Ok(PollOutcome::Unchanged);
        }
        self.last_seen = Some(status.cursor.to_bits());
        self.stats.changes += 1;

        let local = self.bus.cursor()?;
        self.bus.set_cursor(status.cursor)?;
        info!(
            cursor = status.cursor,
            local,
            mode = status.mode,
            "Job status changed"
        );

        if status.is_idle() && local < IDLE_CURSOR {
            warn!(local, "Service cancelled the running cycle");
            self.restart();
            return Ok(PollOutcome::Cancelled);
        }
        Ok(PollOutcome::Changed {
            cursor: status.cursor,
        })
    }

    fn restart(&mut self) {
        let Some((program, args)) = self
            .config
            .restart_command
            .as_ref()
            .and_then(|command| command.split_first())
        else {
            return;
        };
        self.stats.restarts += 1;
        match Command::new(program).args(args).status() {
            Ok(status) if status.success() => info!(command = %program, "Restart command finished"),
            Ok(status) => warn!(command = %program, code = status.code(), "Restart command failed"),
            Err(err) => warn!(command = %program, error = %err, "Restart command could not run"),
        }
    }

    pub fn run(&mut self, stop: &AtomicBool) {
        info!(interval_ms = self.config.interval.as_millis() as u64, "Job poller started");
        while !stop.load(Ordering::Relaxed) {
            if let Err(err) = self.poll_once() {
                warn!(error = %err, "Job poller bus access failed");
            }
            self.clock.sleep(self.config.interval);
        }
        info!(
            polls = self.stats.polls,
            failures = self.stats.failures,
            "Job poller stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use wash_spine::SystemClock;

    struct Scripted(Mutex<VecDeque<Result<JobStatus, RemoteError>>>);

    impl Scripted {
        fn new(replies: Vec<Result<JobStatus, RemoteError>>) -> Self {
            Self(Mutex::new(replies.into()))
        }
    }

    impl JobSource for Scripted {
        fn check_jobs(&self) -> Result<JobStatus, RemoteError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(RemoteError::Status(503)))
        }
    }

    fn job(cursor: f32, mode: f32) -> Result<JobStatus, RemoteError> {
        Ok(JobStatus {
            cursor,
            mode: Some(mode),
        })
    }

    fn poller(replies: Vec<Result<JobStatus, RemoteError>>, bus: &Bus) -> JobPoller<Scripted> {
        JobPoller::new(
            Scripted::new(replies),
            bus.clone(),
            Arc::new(SystemClock::new()),
            JobPollerConfig::default(),
        )
    }

    #[test]
    fn new_job_is_written_to_bus() {
        let bus = Bus::in_memory();
        let mut poller = poller(vec![job(0.0, 1.0)], &bus);

        assert_eq!(poller.poll_once().unwrap(), PollOutcome::Changed { cursor: 0.0 });
        assert_eq!(bus.cursor().unwrap(), 0.0);
        assert_eq!(bus.program_code().unwrap(), 1.0);
    }

    #[test]
    fn repeated_status_does_not_rewind_progress() {
        let bus = Bus::in_memory();
        let mut poller = poller(vec![job(0.0, 0.0), job(0.0, 0.0)], &bus);

        poller.poll_once().unwrap();
        bus.set_cursor(15.0).unwrap();
        assert_eq!(poller.poll_once().unwrap(), PollOutcome::Unchanged);
        assert_eq!(bus.cursor().unwrap(), 15.0);
    }

    #[test]
    fn mode_follows_every_poll() {
        let bus = Bus::in_memory();
        let mut poller = poller(vec![job(5.0, 0.0), job(5.0, 2.0)], &bus);

        poller.poll_once().unwrap();
        poller.poll_once().unwrap();
        assert_eq!(bus.program_code().unwrap(), 2.0);
    }

    #[test]
    fn no_content_keeps_mode() {
        let bus = Bus::in_memory();
        bus.set_program_code(1.0).unwrap();
        let mut poller = poller(vec![Ok(JobStatus::no_job())], &bus);

        poller.poll_once().unwrap();
        assert_eq!(bus.cursor().unwrap(), IDLE_CURSOR);
        assert_eq!(bus.program_code().unwrap(), 1.0);
    }

    #[test]
    fn failures_leave_bus_untouched() {
        let bus = Bus::in_memory();
        bus.set_cursor(20.0).unwrap();
        let mut poller = poller(
            vec![Err(RemoteError::Status(500)), Err(RemoteError::Parse("x".into()))],
            &bus,
        );

        assert_eq!(poller.poll_once().unwrap(), PollOutcome::Unreachable);
        assert_eq!(poller.poll_once().unwrap(), PollOutcome::Unreachable);
        assert_eq!(bus.cursor().unwrap(), 20.0);
        assert_eq!(poller.stats().failures, 2);
    }

    #[test]
    fn idle_status_cancels_running_cycle() {
        let bus = Bus::in_memory();
        let mut poller = poller(vec![job(0.0, 0.0), Ok(JobStatus::no_job())], &bus);
        poller.config.restart_command = Some(vec!["true".to_string()]);

        poller.poll_once().unwrap();
        bus.set_cursor(39.0).unwrap();
        assert_eq!(poller.poll_once().unwrap(), PollOutcome::Cancelled);
        assert_eq!(bus.cursor().unwrap(), IDLE_CURSOR);
        assert_eq!(poller.stats().restarts, 1);
    }

    #[test]
    fn idle_on_idle_does_not_restart() {
        let bus = Bus::in_memory();
        let mut poller = poller(vec![Ok(JobStatus::no_job())], &bus);
        poller.config.restart_command = Some(vec!["true".to_string()]);

        assert_eq!(
            poller.poll_once().unwrap(),
            PollOutcome::Changed { cursor: IDLE_CURSOR }
        );
        assert_eq!(poller.stats().restarts, 0);
    }
}
