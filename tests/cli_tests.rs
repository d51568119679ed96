//! Integration tests for the command-line interface
//!
//! The full-job test drives a shell-script engine that records every
//! operation it is asked to run.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::{self, File};
use std::path::Path;
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ENGINE_SCRIPT: &str = r#"log="$1"
op="$2"
cat > /dev/null
echo "$op" >> "$log"
case "$op" in
  filter-frames) echo '{"visits": [1234]}' ;;
  stack-init) echo '{"nx": 1, "ny": 2, "file_list": [], "wcs": {"ctype": ["RA---TAN", "DEC--TAN"]}}' ;;
  measure-psf) echo '{"sigma": null}' ;;
  *) ;;
esac
"#;

fn stack_exposures() -> Command {
    let mut cmd = Command::cargo_bin("stack-exposures").unwrap();
    cmd.env_remove("STACK_WORLD_SIZE")
        .env_remove("STACK_RANK")
        .env_remove("STACK_ROOT_ADDR")
        .env_remove("STACK_DATA_ROOT")
        .env_remove("STACK_ENGINE");
    cmd
}

/// Rerun `cosmos` with one Suprime-Cam visit (chips 0 and 1 on disk) and a
/// settings file pointing at the recording engine
fn job_dir(registry: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let rerun = dir.path().join("rerun/cosmos");
    fs::create_dir_all(rerun.join("00220/W-S-I+/corr")).unwrap();
    fs::write(rerun.join("registry.json"), registry).unwrap();
    for ccd in 0..2 {
        fs::write(
            rerun.join(format!("00220/W-S-I+/corr/CORR0001234{}.fits", ccd)),
            b"",
        )
        .unwrap();
    }

    let script = dir.path().join("engine.sh");
    fs::write(&script, ENGINE_SCRIPT).unwrap();
    let settings = format!(
        "[butler]\ndata_root = {:?}\n\n[engine]\nprogram = \"sh\"\nargs = [{:?}, {:?}]\ntimeout_secs = 30\n",
        dir.path().display().to_string(),
        script.display().to_string(),
        dir.path().join("engine.log").display().to_string(),
    );
    fs::write(dir.path().join("settings.toml"), settings).unwrap();
    dir
}

fn registry_with_visit() -> String {
    let entries: Vec<String> = (0..2)
        .map(|ccd| {
            format!(
                r#"{{"visit": 1234, "ccd": {}, "field": "COSMOS_0", "filter": "W-S-I+", "pointing": 220}}"#,
                ccd
            )
        })
        .collect();
    format!("[{}]", entries.join(", "))
}

fn engine_log(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("engine.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_help_lists_job_flags() {
    stack_exposures()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("--rerun"))
        .stdout(predicate::str::contains("--doMatchPsf"));
}

#[test]
fn test_missing_required_flags_print_usage() {
    stack_exposures()
        .args(["-r", "cosmos"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_unknown_instrument_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    stack_exposures()
        .current_dir(dir.path())
        .args(["-r", "cosmos", "-p", "COSMOS_0", "-f", "W-S-I+", "-i", "lsst"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown instrument"));

    assert!(!dir.path().join("COSMOS_0").exists());
}

#[test]
fn test_invalid_settings_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let settings = dir.path().join("settings.toml");
    fs::write(&settings, "[stack]\nsub_img_size = 0\n").unwrap();

    stack_exposures()
        .args(["-r", "cosmos", "-p", "COSMOS_0", "-f", "W-S-I+", "-c"])
        .arg(&settings)
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_empty_rerun_creates_work_dir_and_skips_the_engine() {
    let dir = job_dir("[]");
    let work = dir.path().join("work");

    stack_exposures()
        .args(["-r", "cosmos", "-i", "sc", "-p", "COSMOS_0", "-f", "W-S-I+", "-n", "3"])
        .arg("-w")
        .arg(&work)
        .arg("-c")
        .arg(dir.path().join("settings.toml"))
        .assert()
        .success();

    assert!(work.join("COSMOS_0/W-S-I+").is_dir());
    assert!(engine_log(dir.path()).is_empty());
}

#[cfg(unix)]
#[test]
fn test_full_job_runs_every_engine_phase() {
    let dir = job_dir(&registry_with_visit());
    let work = dir.path().join("work");

    stack_exposures()
        .args(["-r", "cosmos", "-i", "suprime-cam", "-p", "COSMOS_0", "-f", "W-S-I+"])
        .args(["-n", "2", "-m"])
        .arg("-w")
        .arg(&work)
        .arg("-c")
        .arg(dir.path().join("settings.toml"))
        .assert()
        .success()
        .stderr(predicate::str::contains("doMatchPsf : true"));

    let mut log = engine_log(dir.path());
    log.sort();
    assert_eq!(
        log,
        vec![
            "filter-frames",
            "stack-execute",
            "stack-execute",
            "stack-finalize",
            "stack-init"
        ]
    );

    let config = dir
        .path()
        .join("rerun/cosmos/stack_config/filter-W-S-I+_stack-220.json");
    let saved: serde_json::Value = serde_json::from_str(&fs::read_to_string(config).unwrap()).unwrap();
    assert_eq!(saved["program"], "COSMOS_0");
    assert_eq!(saved["stack_id"], 220);
}

#[cfg(unix)]
#[test]
fn test_failing_engine_aborts_with_status_one() {
    let dir = job_dir(&registry_with_visit());
    fs::write(dir.path().join("engine.sh"), "cat > /dev/null\necho boom >&2\nexit 7\n").unwrap();

    stack_exposures()
        .args(["-r", "cosmos", "-i", "sc", "-p", "COSMOS_0", "-f", "W-S-I+", "-n", "2"])
        .arg("-w")
        .arg(dir.path().join("work"))
        .arg("-c")
        .arg(dir.path().join("settings.toml"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("in process_mosaic_stack"))
        .stderr(predicate::str::contains("boom"));
}

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Start one rank of a two-process TCP world; stderr goes to `rank{N}.log`
fn spawn_rank(dir: &Path, rank: usize, addr: &str) -> Child {
    let stderr = File::create(dir.join(format!("rank{}.log", rank))).unwrap();
    std::process::Command::new(env!("CARGO_BIN_EXE_stack-exposures"))
        .args(["-r", "cosmos", "-i", "sc", "-p", "COSMOS_0", "-f", "W-S-I+"])
        .arg("-w")
        .arg(dir.join("work"))
        .arg("-c")
        .arg(dir.join("settings.toml"))
        .env("STACK_WORLD_SIZE", "2")
        .env("STACK_RANK", rank.to_string())
        .env("STACK_ROOT_ADDR", addr)
        .env_remove("STACK_DATA_ROOT")
        .env_remove("STACK_ENGINE")
        .stdout(Stdio::null())
        .stderr(stderr)
        .spawn()
        .unwrap()
}

/// Exit code of `child`, killing it if it outlives `limit`
fn exit_code_within(mut child: Child, limit: Duration) -> Option<i32> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status.code();
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("rank still running after {:?}", limit);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(unix)]
#[test]
fn test_two_process_world_runs_the_job() {
    let dir = job_dir(&registry_with_visit());
    let addr = free_addr();

    let worker = spawn_rank(dir.path(), 1, &addr);
    let root = spawn_rank(dir.path(), 0, &addr);

    assert_eq!(exit_code_within(root, Duration::from_secs(60)), Some(0));
    assert_eq!(exit_code_within(worker, Duration::from_secs(60)), Some(0));

    let mut log = engine_log(dir.path());
    log.sort();
    assert_eq!(
        log,
        vec![
            "filter-frames",
            "stack-execute",
            "stack-execute",
            "stack-finalize",
            "stack-init"
        ]
    );
}

#[cfg(unix)]
#[test]
fn test_two_process_world_aborts_every_rank() {
    let dir = job_dir(&registry_with_visit());
    fs::write(dir.path().join("engine.sh"), "cat > /dev/null\necho boom >&2\nexit 7\n").unwrap();
    let addr = free_addr();

    let worker = spawn_rank(dir.path(), 1, &addr);
    let root = spawn_rank(dir.path(), 0, &addr);

    assert_eq!(exit_code_within(root, Duration::from_secs(60)), Some(1));
    assert_eq!(exit_code_within(worker, Duration::from_secs(60)), Some(1));

    let root_log = fs::read_to_string(dir.path().join("rank0.log")).unwrap();
    assert!(root_log.contains("in process_mosaic_stack"));
    assert!(root_log.contains("boom"));
    let worker_log = fs::read_to_string(dir.path().join("rank1.log")).unwrap();
    assert!(worker_log.contains("job aborted by rank 0"));
}
