use std::path::PathBuf;
use std::time::Duration;
use wash_io::jobs::ENV_CHECK_INTERVAL;
use wash_io::remote::{ENV_BASE_URL, ENV_DEVICE_ID, ENV_HUB_ID, ENV_REQUEST_TIMEOUT};
use wash_io::{RemoteConfig, RemoteError};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub shm_root: PathBuf,
    pub simulate: bool,
    pub gpio_offset: u32,
    pub remote_enabled: bool,
    pub api_base_url: Option<String>,
    pub hub_id: Option<String>,
    pub device_id: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub check_interval_secs: Option<u64>,
    pub restart_command: Option<Vec<String>>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub journal_path: Option<PathBuf>,
    pub start_program: Option<String>,
    pub dump_bus: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            shm_root: PathBuf::from(wash_io::shm::DEFAULT_ROOT),
            simulate: false,
            gpio_offset: 0,
            remote_enabled: true,
            api_base_url: None,
            hub_id: None,
            device_id: None,
            request_timeout_secs: None,
            check_interval_secs: None,
            restart_command: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            journal_path: None,
            start_program: None,
            dump_bus: false,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--run-seconds" => {
                    if i + 1 < args.len() {
                        cfg.run_seconds = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "--shm-root" => {
                    if i + 1 < args.len() {
                        cfg.shm_root = PathBuf::from(&args[i + 1]);
                        i += 1;
                    }
                }
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--gpio-offset" => {
                    if i + 1 < args.len() {
                        cfg.gpio_offset = args[i + 1].parse().unwrap_or(0);
                        i += 1;
                    }
                }
                "--no-remote" => {
                    cfg.remote_enabled = false;
                }
                "--api-base-url" => {
                    if i + 1 < args.len() {
                        cfg.api_base_url = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--hub-id" => {
                    if i + 1 < args.len() {
                        cfg.hub_id = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--device-id" => {
                    if i + 1 < args.len() {
                        cfg.device_id = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--request-timeout" => {
                    if i + 1 < args.len() {
                        cfg.request_timeout_secs = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "--check-interval" => {
                    if i + 1 < args.len() {
                        cfg.check_interval_secs = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "--restart-cmd" => {
                    if i + 1 < args.len() {
                        let words: Vec<String> =
                            args[i + 1].split_whitespace().map(str::to_string).collect();
                        cfg.restart_command = (!words.is_empty()).then_some(words);
                        i += 1;
                    }
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    if i + 1 < args.len() {
                        cfg.log_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--metrics-addr" => {
                    if i + 1 < args.len() {
                        cfg.metrics_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--journal" => {
                    if i + 1 < args.len() {
                        cfg.journal_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--start-program" => {
                    if i + 1 < args.len() {
                        cfg.start_program = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--dump-bus" => {
                    cfg.dump_bus = true;
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    /// Job service settings: flags first, then the environment. `Ok(None)`
    /// when no base URL is known.
    pub fn remote(&self) -> Result<Option<RemoteConfig>, RemoteError> {
        let flag = |key: &str| match key {
            ENV_BASE_URL => self.api_base_url.clone(),
            ENV_HUB_ID => self.hub_id.clone(),
            ENV_DEVICE_ID => self.device_id.clone(),
            ENV_REQUEST_TIMEOUT => self.request_timeout_secs.map(|secs| secs.to_string()),
            _ => None,
        };
        RemoteConfig::from_lookup(|key| flag(key).or_else(|| std::env::var(key).ok()))
    }

    pub fn check_interval(&self) -> Duration {
        let secs = self.check_interval_secs.or_else(|| {
            std::env::var(ENV_CHECK_INTERVAL)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
        });
        Duration::from_secs(secs.unwrap_or(5).max(1))
    }

    pub fn print_help() {
        println!(
            r#"wash-plc - Washing machine cycle controller

USAGE:
    wash-plc [OPTIONS]

OPTIONS:
    --shm-root <PATH>        Directory holding the shared bus cells [default: /dev/shm]
    --simulate               Drive a simulated washer instead of the GPIO board
    --gpio-offset <N>        Added to every BCM pin number (sysfs chip base) [default: 0]
    --run-seconds <SECS>     Run for a fixed duration then exit
    --no-remote              Do not poll the job service
    --api-base-url <URL>     Job service base URL
    --hub-id <ID>            Hub identifier sent with every request
    --device-id <N>          Device identifier sent with every request
    --request-timeout <SECS> Job service request timeout [default: 10]
    --check-interval <SECS>  Job poll interval [default: 5]
    --restart-cmd <CMD>      Command run when the service cancels a running cycle
    --start-program <NAME>   Start a cycle locally (quick|heavy|heavy_extended_drain)
    --dump-bus               Print every bus cell as JSON and exit
    --json-logs              Output logs in JSON format (for log aggregation)
    --log-dir <PATH>         Also write JSON logs to a daily rolling file in PATH
    --metrics-addr <ADDR>    Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --journal <PATH>         Append cycle events to the specified JSONL file
    -h, --help               Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                 Set log filter (e.g., RUST_LOG=debug,wash_spine=trace)
    API_BASE_URL             Job service base URL
    HUB_ID                   Hub identifier
    DEVICE_ID                Device identifier (integer)
    REQUEST_TIMEOUT          Job service request timeout in seconds
    CHECK_INTERVAL           Job poll interval in seconds
    WASH_GPIO_ROOT           sysfs GPIO root [default: /sys/class/gpio]

EXAMPLES:
    # Bench run against the simulated washer
    wash-plc --simulate --shm-root /tmp/wash --no-remote --start-program quick

    # Production run with metrics and a journal
    wash-plc --metrics-addr 0.0.0.0:9090 --journal /var/log/washer/cycles.jsonl \
        --restart-cmd "sudo systemctl restart washer.service"

    # Inspect the bus of a running controller
    wash-plc --dump-bus
"#
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("wash-plc")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn defaults() {
        let cfg = RuntimeConfig::from_args(&args(&[]));
        assert_eq!(cfg.shm_root, PathBuf::from("/dev/shm"));
        assert!(cfg.remote_enabled);
        assert!(!cfg.simulate);
        assert!(cfg.run_seconds.is_none());
    }

    #[test]
    fn parses_flags() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--simulate",
            "--shm-root",
            "/tmp/bus",
            "--run-seconds",
            "3",
            "--no-remote",
            "--restart-cmd",
            "systemctl restart washer",
            "--start-program",
            "heavy",
            "--check-interval",
            "2",
            "--unknown",
        ]));
        assert!(cfg.simulate);
        assert_eq!(cfg.shm_root, PathBuf::from("/tmp/bus"));
        assert_eq!(cfg.run_seconds, Some(3));
        assert!(!cfg.remote_enabled);
        assert_eq!(
            cfg.restart_command,
            Some(vec![
                "systemctl".to_string(),
                "restart".to_string(),
                "washer".to_string()
            ])
        );
        assert_eq!(cfg.start_program.as_deref(), Some("heavy"));
        assert_eq!(cfg.check_interval(), Duration::from_secs(2));
    }

    #[test]
    fn help_stops_parsing() {
        let cfg = RuntimeConfig::from_args(&args(&["-h", "--simulate"]));
        assert!(cfg.show_help);
        assert!(!cfg.simulate);
    }

    #[test]
    fn remote_flags_override_environment() {
        let cfg = RuntimeConfig::from_args(&args(&[
            "--api-base-url",
            "http://hub.local",
            "--hub-id",
            "h1",
            "--device-id",
            "9",
            "--request-timeout",
            "4",
        ]));
        let remote = cfg.remote().unwrap().unwrap();
        assert_eq!(remote.base_url, "http://hub.local");
        assert_eq!(remote.hub_id, "h1");
        assert_eq!(remote.device_id, 9);
        assert_eq!(remote.request_timeout, Duration::from_secs(4));
    }
}
