use std::path::Path;
use std::process::{Command, Output};

fn binary() -> String {
    // Prefer the test-built binary when available to avoid extra cargo builds.
    std::env::var("CARGO_BIN_EXE_wash-plc").unwrap_or_else(|_| {
        let candidates = [
            "../../target/release/wash-plc",
            "target/release/wash-plc",
            "../../target/debug/wash-plc",
            "target/debug/wash-plc",
        ];
        for candidate in candidates {
            if Path::new(candidate).exists() {
                return candidate.to_string();
            }
        }
        panic!("Failed to locate wash-plc binary. Expected CARGO_BIN_EXE_wash-plc or a build in target/{{release,debug}}/wash-plc.");
    })
}

fn run(args: &[&str]) -> Output {
    Command::new(binary())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to run wash-plc")
}

fn cell(root: &Path, key: &str) -> f32 {
    let bytes = std::fs::read(root.join(key)).unwrap();
    f32::from_ne_bytes(bytes[..4].try_into().unwrap())
}

#[test]
fn simulated_run_leaves_relays_off() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("shm");
    std::fs::create_dir(&root).unwrap();
    let journal = dir.path().join("journal.jsonl");

    let output = run(&[
        "--simulate",
        "--no-remote",
        "--shm-root",
        root.to_str().unwrap(),
        "--journal",
        journal.to_str().unwrap(),
        "--run-seconds",
        "2",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    assert_eq!(cell(&root, "relay_command"), 14.0);
    assert_eq!(cell(&root, "command_from_server"), 1000.0);
    // The simulated tub starts empty, so the level sensor sees the top of its range.
    assert!(cell(&root, "Pressure") > 20.0);
    assert_eq!(cell(&root, "Door_Status"), 1.0);

    let content = std::fs::read_to_string(&journal).unwrap();
    let events: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["event_type"], "system_start");
    assert_eq!(events.last().unwrap()["event_type"], "system_shutdown");
}

#[test]
fn persisted_cursor_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(root.join("command_from_server"), 39.0f32.to_ne_bytes()).unwrap();
    std::fs::write(root.join("triac_delay"), 7000.0f32.to_ne_bytes()).unwrap();

    let output = run(&["--dump-bus", "--shm-root", root.to_str().unwrap()]);
    assert!(output.status.success());

    let cells: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(cells["triac_delay"], 7000.0);
    assert_eq!(cells["command_from_server"], 39.0);
    assert_eq!(cells["relay_command"], 14.0);
    assert_eq!(cells["fault_code"], 0.0);
}

#[test]
fn unknown_program_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&[
        "--simulate",
        "--no-remote",
        "--shm-root",
        dir.path().to_str().unwrap(),
        "--start-program",
        "delicate",
        "--run-seconds",
        "1",
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("delicate"));
}

fn journal_events(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn quick_program_latches_door_and_advances() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("shm");
    std::fs::create_dir(&root).unwrap();
    let journal = dir.path().join("journal.jsonl");

    // Step 0 waits, pulses the latch and lets it settle before moving on.
    let output = run(&[
        "--simulate",
        "--no-remote",
        "--shm-root",
        root.to_str().unwrap(),
        "--journal",
        journal.to_str().unwrap(),
        "--start-program",
        "quick",
        "--run-seconds",
        "30",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let dump = run(&["--dump-bus", "--shm-root", root.to_str().unwrap()]);
    assert!(dump.status.success());
    let cells: serde_json::Value = serde_json::from_slice(&dump.stdout).unwrap();
    let cursor = cells["command_from_server"].as_f64().unwrap();
    assert!((5.0..1000.0).contains(&cursor), "cursor {cursor}");
    assert_eq!(cells["Door_Status"], 0.0);
    assert_eq!(cells["fault_code"], 0.0);
    assert_eq!(cells["relay_command"], 14.0);

    let events = journal_events(&journal);
    assert!(events.iter().any(|event| {
        event["event_type"] == "step_completed"
            && event["details"]["threshold"] == 0.0
            && event["details"]["next"] == 5.0
    }));
}

#[test]
fn tumble_step_levels_drum_speed() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("shm");
    std::fs::create_dir(&root).unwrap();
    let journal = dir.path().join("journal.jsonl");
    // Quick program, resumed at its soak tumble.
    std::fs::write(root.join("command_mode_from_server"), 0.0f32.to_ne_bytes()).unwrap();
    std::fs::write(root.join("command_from_server"), 15.0f32.to_ne_bytes()).unwrap();

    let output = run(&[
        "--simulate",
        "--no-remote",
        "--shm-root",
        root.to_str().unwrap(),
        "--journal",
        journal.to_str().unwrap(),
        "--run-seconds",
        "12",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let events = journal_events(&journal);
    let levelled = events
        .iter()
        .find(|event| event["event_type"] == "levelled")
        .expect("no levelled event in journal");
    let details = &levelled["details"];
    assert_eq!(details["target_hz"], 30.0);
    assert_eq!(details["outcome"]["result"], "converged");
    assert!(details["outcome"]["delay_us"].as_f64().unwrap() < 8000.0);
    assert!(details["outcome"]["iterations"].as_u64().unwrap() >= 1);
}
