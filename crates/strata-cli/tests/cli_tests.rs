use pretty_assertions::assert_eq;
use std::path::Path;
use std::process::{Command, Output};

const FAST_CONFIG: &str = r#"
cluster_name = "ci-cluster"

[readiness]
poll_interval_ms = 5
infrastructure_timeout_secs = 5
release_timeout_secs = 5
policy_settle_ms = 0
"#;

fn strata(dir: &Path, args: &[&str]) -> Output {
    let config = dir.join("strata.toml");
    if !config.exists() {
        std::fs::write(&config, FAST_CONFIG).unwrap();
    }
    Command::new(env!("CARGO_BIN_EXE_strata"))
        .args(args)
        .arg("--config")
        .arg(&config)
        .arg("--state-dir")
        .arg(dir.join("state"))
        .env("RUST_LOG", "warn")
        .env_remove("STRATA_CLUSTER_NAME")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_preview_apply_outputs_destroy() {
    let dir = tempfile::tempdir().unwrap();

    let preview = strata(dir.path(), &["preview"]);
    assert_eq!(preview.status.code(), Some(0));
    assert!(stdout(&preview).contains("29 to create, 0 to update, 0 unchanged, 0 to destroy"));

    let apply = strata(dir.path(), &["apply"]);
    assert_eq!(apply.status.code(), Some(0), "{}", stdout(&apply));
    assert!(stdout(&apply).contains("SUCCESS"));
    assert!(dir.path().join("state/cloud.json").exists());
    assert!(dir.path().join("state/records/cluster.cluster.json").exists());

    let outputs = strata(dir.path(), &["outputs", "--json"]);
    assert_eq!(outputs.status.code(), Some(0));
    let exports: serde_json::Value = serde_json::from_slice(&outputs.stdout).unwrap();
    assert_eq!(exports["cluster_name"], "ci-cluster");
    assert_eq!(exports["aws_region"], "us-west-2");
    assert!(exports["vpc_id"].as_str().unwrap().starts_with("vpc-"));

    // A second invocation sees the persisted cloud and state.
    let again = strata(dir.path(), &["preview"]);
    assert!(stdout(&again).contains("0 to create, 0 to update, 29 unchanged"));

    let destroy = strata(dir.path(), &["destroy"]);
    assert_eq!(destroy.status.code(), Some(0), "{}", stdout(&destroy));

    let after = strata(dir.path(), &["outputs", "--json"]);
    let exports: serde_json::Value = serde_json::from_slice(&after.stdout).unwrap();
    assert!(exports.get("vpc_id").is_none());
}

#[test]
fn test_invalid_configuration_exits_with_two() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("strata.toml"), "min_size = 9\n").unwrap();

    let output = strata(dir.path(), &["preview"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("min <= desired <= max"), "{stderr}");
}

#[test]
fn test_json_plan_is_machine_readable() {
    let dir = tempfile::tempdir().unwrap();
    let output = strata(dir.path(), &["preview", "--json"]);
    assert_eq!(output.status.code(), Some(0));
    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(plan["steps"].as_array().unwrap().len(), 29);
    assert_eq!(plan["steps"][0]["action"], "create");
}

#[test]
fn test_apply_refuses_a_state_dir_locked_by_another_run() {
    let dir = tempfile::tempdir().unwrap();
    let records = dir.path().join("state/records");
    std::fs::create_dir_all(&records).unwrap();
    std::fs::write(records.join("network.vpc.lock"), "other-run\n").unwrap();

    let output = strata(dir.path(), &["apply"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("network.vpc.lock"), "{stderr}");
    assert!(!dir.path().join("state/records/network.vpc.json").exists());
}
