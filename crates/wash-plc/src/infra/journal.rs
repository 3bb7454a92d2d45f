//! Cycle journal.
//!
//! Append-only JSONL record of controller lifecycle, program steps and job
//! changes, kept so a finished or interrupted wash can be reconstructed
//! after the fact.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use wash_io::{JobSource, JobStatus, RemoteError};
use wash_spine::{CycleEvent, CycleObserver, TimeBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    SystemStart,
    SystemShutdown,
    ProgramRequested,
    JobChanged,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepAborted,
    Levelled,
    CycleFinished,
}

impl JournalEventType {
    fn of(event: &CycleEvent) -> Self {
        match event {
            CycleEvent::StepStarted { .. } => Self::StepStarted,
            CycleEvent::StepCompleted { .. } => Self::StepCompleted,
            CycleEvent::StepFailed { .. } => Self::StepFailed,
            CycleEvent::StepAborted { .. } => Self::StepAborted,
            CycleEvent::Levelled { .. } => Self::Levelled,
            CycleEvent::CycleFinished { .. } => Self::CycleFinished,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: JournalEventType,
    pub details: serde_json::Value,
}

/// Thread-safe JSONL writer.
pub struct CycleJournal {
    writer: Mutex<BufWriter<File>>,
    timebase: TimeBase,
}

impl CycleJournal {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path, timebase: TimeBase) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
            timebase,
        })
    }

    pub fn log(&self, entry: &JournalEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        event_type: JournalEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&JournalEntry {
            timestamp_us: self.timebase.now_us(),
            unix_us: self.timebase.unix_us(),
            event_type,
            details,
        })
    }
}

impl CycleObserver for CycleJournal {
    fn on_event(&self, event: &CycleEvent) {
        let details = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        if let Err(err) = self.log_event(JournalEventType::of(event), details) {
            tracing::warn!(error = %err, "Failed to write journal entry");
        }
    }
}

/// Wraps a job source and journals every change in what it reports.
pub struct JournaledSource<S> {
    inner: S,
    journal: Arc<CycleJournal>,
    last: Mutex<Option<JobStatus>>,
}

impl<S> JournaledSource<S> {
    pub fn new(inner: S, journal: Arc<CycleJournal>) -> Self {
        Self {
            inner,
            journal,
            last: Mutex::new(None),
        }
    }
}

impl<S: JobSource> JobSource for JournaledSource<S> {
    fn check_jobs(&self) -> Result<JobStatus, RemoteError> {
        let status = self.inner.check_jobs()?;
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if *last != Some(status) {
            *last = Some(status);
            let details = serde_json::json!({
                "cursor": status.cursor,
                "mode": status.mode,
            });
            if let Err(err) = self.journal.log_event(JournalEventType::JobChanged, details) {
                tracing::warn!(error = %err, "Failed to write journal entry");
            }
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;
    use wash_spine::{Clock, Program, SystemClock, VirtualClock};

    fn wall_time() -> TimeBase {
        TimeBase::new(Arc::new(SystemClock::new()))
    }

    fn read_entries(path: &Path) -> Vec<JournalEntry> {
        let mut content = String::new();
        File::open(path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn writes_jsonl_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/journal.jsonl");
        let journal = CycleJournal::new(&path, wall_time()).unwrap();

        journal
            .log_event(
                JournalEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();
        journal.on_event(&CycleEvent::StepCompleted {
            program: Program::Heavy,
            threshold: 15.0,
            next: 20.0,
        });

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, JournalEventType::SystemStart);
        assert_eq!(entries[1].event_type, JournalEventType::StepCompleted);
        assert_eq!(entries[1].details["event"], "step_completed");
        assert_eq!(entries[1].details["program"], "heavy");
        assert_eq!(entries[1].details["next"], 20.0);
        assert!(entries[1].timestamp_us >= entries[0].timestamp_us);
    }

    #[test]
    fn reopening_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        for _ in 0..2 {
            let journal = CycleJournal::new(&path, wall_time()).unwrap();
            journal
                .log_event(JournalEventType::SystemShutdown, serde_json::Value::Null)
                .unwrap();
        }
        assert_eq!(read_entries(&path).len(), 2);
    }

    #[test]
    fn entries_carry_controller_time() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let clock = Arc::new(VirtualClock::new());
        let journal = CycleJournal::new(&path, TimeBase::new(clock.clone())).unwrap();

        journal
            .log_event(JournalEventType::SystemStart, serde_json::Value::Null)
            .unwrap();
        clock.sleep(std::time::Duration::from_secs(3));
        journal
            .log_event(JournalEventType::SystemShutdown, serde_json::Value::Null)
            .unwrap();

        let entries = read_entries(&path);
        assert_eq!(entries[0].timestamp_us, 0);
        assert_eq!(entries[1].timestamp_us, 3_000_000);
    }

    struct Fixed(JobStatus);

    impl JobSource for Fixed {
        fn check_jobs(&self) -> Result<JobStatus, RemoteError> {
            Ok(self.0)
        }
    }

    #[test]
    fn job_changes_are_journaled_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Arc::new(CycleJournal::new(&path, wall_time()).unwrap());
        let source = JournaledSource::new(
            Fixed(JobStatus {
                cursor: 0.0,
                mode: Some(1.0),
            }),
            journal,
        );

        for _ in 0..3 {
            source.check_jobs().unwrap();
        }

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, JournalEventType::JobChanged);
        assert_eq!(entries[0].details["mode"], 1.0);
    }
}
