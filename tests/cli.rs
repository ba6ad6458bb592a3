use rusqlite::Connection;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn home_path(home: &TempDir) -> &Path {
    home.path()
}

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_cloudspend")
}

fn run_cmd(home: &TempDir, args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .env("CLOUDSPEND_HOME", home_path(home))
        .env_remove("CLOUDSPEND_LOG")
        .env_remove("AZURE_SUBSCRIPTION_ID")
        .env_remove("AZURE_ACCESS_TOKEN")
        .output()
        .expect("run cloudspend command")
}

fn db_path(home: &TempDir) -> PathBuf {
    home.path().join("data").join("costs.sqlite")
}

fn today() -> String {
    chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

fn seed_cost_row(home: &TempDir, service: &str, group: Option<&str>, cost: f64, date: &str) {
    let conn = Connection::open(db_path(home)).expect("open sqlite");
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS cost_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL CHECK (account_id <> ''),
            resource_group TEXT,
            service_name TEXT NOT NULL CHECK (service_name <> ''),
            cost REAL NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD' CHECK (currency <> ''),
            date TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        "#,
    )
    .expect("create cost table");

    conn.execute(
        "INSERT INTO cost_records (account_id, resource_group, service_name, cost, currency, date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params!["sub-1", group, service, cost, "USD", date],
    )
    .expect("insert cost row");
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("valid json output")
}

#[test]
fn init_creates_config_and_data_paths() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["init"]);
    assert!(output.status.success());

    assert!(home.path().join("config").exists());
    assert!(home.path().join("data").exists());
    assert!(home.path().join("config").join("config.toml").exists());
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("temp home");

    assert!(run_cmd(&home, &["init"]).status.success());
    let first = fs::read_to_string(home.path().join("config").join("config.toml"))
        .expect("read config after first init");

    assert!(run_cmd(&home, &["init"]).status.success());
    let second = fs::read_to_string(home.path().join("config").join("config.toml"))
        .expect("read config after second init");

    assert_eq!(first, second);
}

#[test]
fn export_rejects_unknown_format() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["export", "--format", "xml"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported export format. Use json or csv"));
}

#[test]
fn export_csv_outputs_header_and_escaped_fields() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_cost_row(&home, "Storage, \"hot\" tier", Some("rg-a"), 1.25, "2024-01-01");

    let output = run_cmd(&home, &["export", "--format", "csv"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("id,account_id,resource_group,service_name,cost,currency,date"));
    assert!(stdout.contains("\"Storage, \"\"hot\"\" tier\""));
    assert!(stdout.contains("2024-01-01"));
}

#[test]
fn export_json_outputs_valid_array() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_cost_row(&home, "Virtual Machines", None, 2.5, "2024-01-02");

    let output = run_cmd(&home, &["export", "--format", "json"]);
    assert!(output.status.success());

    let parsed = stdout_json(&output);
    let arr = parsed.as_array().expect("json array");
    assert_eq!(arr.len(), 1);
    assert_eq!(arr[0]["service_name"], "Virtual Machines");
    assert_eq!(arr[0]["date"], "2024-01-02");
    assert!(arr[0]["resource_group"].is_null());
}

#[test]
fn summary_json_breaks_down_seeded_costs() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_cost_row(&home, "Storage", Some("rg-a"), 1.25, "2024-01-05");
    seed_cost_row(&home, "Compute", Some("rg-b"), 2.75, "2024-01-20");
    seed_cost_row(&home, "Compute", Some("rg-b"), 9.0, "2024-02-01");

    let output = run_cmd(
        &home,
        &[
            "cost", "summary", "--start", "2024-01-01", "--end", "2024-01-31", "--output", "json",
        ],
    );
    assert!(output.status.success());
    let summary = stdout_json(&output);
    assert_eq!(summary["period"], "2024-01-01 to 2024-01-31");
    assert_eq!(summary["total_cost"], 4.0);
    assert_eq!(summary["by_service"]["Compute"], 2.75);
    assert_eq!(summary["by_resource_group"]["rg-a"], 1.25);
}

#[test]
fn summary_rejects_malformed_dates() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["cost", "summary", "--start", "01/02/2024"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Use YYYY-MM-DD"));
}

#[test]
fn trend_without_history_reports_no_data() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["cost", "trend", "--output", "json"]);
    assert!(output.status.success());
    let trend = stdout_json(&output);
    assert_eq!(trend["trend"], "no_data");
    assert_eq!(trend["projection"], 0.0);
}

#[test]
fn report_lists_top_services_by_cost() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    let date = today();
    seed_cost_row(&home, "Storage", None, 1.0, &date);
    seed_cost_row(&home, "Compute", None, 5.0, &date);

    let output = run_cmd(&home, &["cost", "report", "--output", "json"]);
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["top_services"][0]["service"], "Compute");
    assert_eq!(report["top_services"][1]["service"], "Storage");
    assert_eq!(report["total_cost"], 6.0);
}

#[test]
fn alert_lifecycle_add_check_delete() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_cost_row(&home, "Storage", None, 7.32, &today());

    assert!(run_cmd(&home, &["alert", "add", "budget-5", "5"]).status.success());
    assert!(run_cmd(&home, &["alert", "add", "budget-10", "--preset", "medium"])
        .status
        .success());

    let duplicate = run_cmd(&home, &["alert", "add", "budget-5", "8"]);
    assert!(!duplicate.status.success());
    assert!(String::from_utf8_lossy(&duplicate.stderr).contains("already exists"));

    let listed = stdout_json(&run_cmd(&home, &["alert", "list", "--output", "json"]));
    assert_eq!(listed.as_array().expect("array").len(), 2);

    let check = run_cmd(&home, &["alert", "check", "--output", "json"]);
    assert!(check.status.success());
    let evaluation = stdout_json(&check);
    assert_eq!(evaluation["triggered"], serde_json::json!(["budget-5"]));

    assert!(run_cmd(&home, &["alert", "delete", "budget-5"]).status.success());
    let missing = run_cmd(&home, &["alert", "delete", "budget-5"]);
    assert!(!missing.status.success());
}

#[test]
fn alert_add_rejects_non_positive_threshold() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["alert", "add", "zero", "0"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("greater than zero"));
}

#[test]
fn free_tier_classifies_usage() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(
        &home,
        &["free-tier", "virtual_machines", "600", "--output", "json"],
    );
    assert!(output.status.success());
    let usage = stdout_json(&output);
    assert_eq!(usage["status"], "warning");
    assert_eq!(usage["limit"], 750.0);
    assert_eq!(usage["percent_used"], 80.0);

    let unknown = stdout_json(&run_cmd(
        &home,
        &["free-tier", "mystery", "1", "--output", "json"],
    ));
    assert_eq!(unknown["status"], "unknown");
    assert!(unknown["percent_used"].is_null());
}

#[test]
fn config_set_routes_account_to_settings_and_validates_provider() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["config", "set", "account_id", "sub-42"])
        .status
        .success());
    let got = run_cmd(&home, &["config", "get", "account_id"]);
    assert_eq!(String::from_utf8_lossy(&got.stdout).trim(), "sub-42");

    assert!(run_cmd(&home, &["config", "set", "provider", "GCP"])
        .status
        .success());
    let config = fs::read_to_string(home.path().join("config").join("config.toml"))
        .expect("read config");
    assert!(config.contains("provider = \"gcp\""));

    let bad = run_cmd(&home, &["config", "set", "provider", "oracle"]);
    assert!(!bad.status.success());
    assert!(String::from_utf8_lossy(&bad.stderr).contains("Unsupported provider"));
}

#[test]
fn fetch_without_account_fails_with_config_error() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["cost", "fetch"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No account id configured"));
}
