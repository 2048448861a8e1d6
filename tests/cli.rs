mod common;

use assert_cmd::Command;
use common::TestWorkspace;
use predicates::prelude::*;

fn medallion() -> Command {
    Command::cargo_bin("commerce-medallion").expect("binary exists")
}

fn run_pipeline(workspace: &TestWorkspace) -> assert_cmd::assert::Assert {
    medallion()
        .args([
            "run",
            "-c",
            workspace.join("catalog.yml").to_str().unwrap(),
            "--config",
            workspace.join("pipeline.yml").to_str().unwrap(),
            "--store",
            workspace.join("store").to_str().unwrap(),
            "--base-dir",
            workspace.path().to_str().unwrap(),
        ])
        .assert()
}

#[test]
fn describe_lists_catalog_sources() {
    let workspace = TestWorkspace::with_sample_sources();
    medallion()
        .args(["describe", "-c", workspace.join("catalog.yml").to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("orders"))
        .stdout(predicate::str::contains("customers"))
        .stdout(predicate::str::contains("delimited"));
}

#[test]
fn describe_shows_declared_columns_of_one_source() {
    let workspace = TestWorkspace::with_sample_sources();
    medallion()
        .args([
            "describe",
            "-c",
            workspace.join("catalog.yml").to_str().unwrap(),
            "-s",
            "orders",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("ordered_at"))
        .stdout(predicate::str::contains("datetime"))
        .stdout(predicate::str::contains("decimal"));
}

#[test]
fn describe_unknown_source_fails() {
    let workspace = TestWorkspace::with_sample_sources();
    medallion()
        .args([
            "describe",
            "-c",
            workspace.join("catalog.yml").to_str().unwrap(),
            "-s",
            "reviews",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reviews"));
}

#[test]
fn enforce_reports_violations_per_column() {
    let workspace = TestWorkspace::with_sample_sources();
    let report_path = workspace.join("orders-report.json");
    medallion()
        .args([
            "enforce",
            "-c",
            workspace.join("catalog.yml").to_str().unwrap(),
            "-s",
            "orders",
            "--base-dir",
            workspace.path().to_str().unwrap(),
            "--report",
            report_path.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("ordered_at"))
        .stdout(predicate::str::contains("5 row(s), 1 with violations"));

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).expect("report"))
            .expect("json report");
    assert_eq!(report["total_rows"], 5);
    assert_eq!(report["dropped_columns"][0], "channel");
}

#[test]
fn enforce_streams_cleansed_rows_to_stdout() {
    let workspace = TestWorkspace::with_sample_sources();
    medallion()
        .args([
            "enforce",
            "-c",
            workspace.join("catalog.yml").to_str().unwrap(),
            "-s",
            "orders",
            "-i",
            workspace.join("orders.csv").to_str().unwrap(),
            "-o",
            "-",
        ])
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "order_id,customer_id,ordered_at,delivered_at,total,status",
        ))
        .stdout(predicate::str::contains("1200.50"))
        .stdout(predicate::str::contains("channel").not());
}

#[test]
fn run_then_show_published_kpis() {
    let workspace = TestWorkspace::with_sample_sources();
    run_pipeline(&workspace)
        .success()
        .stdout(predicate::str::contains("revenue_by_state"))
        .stdout(predicate::str::contains("published"));

    medallion()
        .args([
            "show",
            "--store",
            workspace.join("store").to_str().unwrap(),
            "-t",
            "totals",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("TotalRevenue"))
        .stdout(predicate::str::contains("1385.50"));
}

#[test]
fn second_run_reports_unchanged_tables() {
    let workspace = TestWorkspace::with_sample_sources();
    run_pipeline(&workspace).success();
    run_pipeline(&workspace)
        .success()
        .stdout(predicate::str::contains("unchanged"))
        .stdout(predicate::str::contains("published").not());

    medallion()
        .args([
            "history",
            "--store",
            workspace.join("store").to_str().unwrap(),
            "-t",
            "customer_segments",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("*"));
}

#[test]
fn run_writes_a_json_report() {
    let workspace = TestWorkspace::with_sample_sources();
    let report_path = workspace.join("run.json");
    medallion()
        .args([
            "run",
            "-c",
            workspace.join("catalog.yml").to_str().unwrap(),
            "--config",
            workspace.join("pipeline.yml").to_str().unwrap(),
            "--store",
            workspace.join("store").to_str().unwrap(),
            "--base-dir",
            workspace.path().to_str().unwrap(),
            "--reference-date",
            "2024-03-01",
            "--report",
            report_path.to_str().unwrap(),
        ])
        .assert()
        .success();

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).expect("report"))
            .expect("json report");
    assert_eq!(report["reference_date"], "2024-03-01");
    assert_eq!(report["customers"], 3);
    assert_eq!(report["skipped_orders"], 1);
    assert_eq!(report["tables"].as_array().map(Vec::len), Some(7));
}

#[test]
fn show_unpublished_table_fails() {
    let workspace = TestWorkspace::with_sample_sources();
    run_pipeline(&workspace).success();
    medallion()
        .args([
            "show",
            "--store",
            workspace.join("store").to_str().unwrap(),
            "-t",
            "weekly_revenue",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("has not been published"));
}

#[test]
fn show_without_a_store_fails() {
    let workspace = TestWorkspace::new();
    medallion()
        .args([
            "show",
            "--store",
            workspace.join("missing").to_str().unwrap(),
            "-t",
            "totals",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
