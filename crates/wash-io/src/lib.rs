pub mod hal_sysfs;
pub mod jobs;
pub mod metrics;
pub mod remote;
pub mod shm;

pub use hal_sysfs::{BoardPins, EdgeListener, SysfsBoard, SysfsEdgeSource, SysfsError, SysfsLine};
pub use jobs::{JobPoller, JobPollerConfig, JobSource, PollOutcome};
pub use metrics::{init_metrics, mark_ready, serve_metrics, spawn_bus_monitor, MetricsObserver};
pub use remote::{JobStatus, RemoteClient, RemoteConfig, RemoteError};
pub use shm::ShmStore;
