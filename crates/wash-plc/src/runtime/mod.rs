mod app;
mod config;
mod logging;
mod rig;
mod telemetry;

pub use app::run_from_args;
