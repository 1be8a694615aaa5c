use std::fs;
use std::path::PathBuf;

use clap::Parser;
use ulid::Ulid;

use runledger_cli::{run_cli, Cli};
use runledger_domain::Status;
use runledger_store_sqlite::SqliteRunStore;

fn temp_path(name: &str, suffix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("runledger-cli-test-{}-{}.{}", name, Ulid::new(), suffix))
}

fn run(args: &[&str]) -> anyhow::Result<()> {
    run_cli(Cli::parse_from(args))
}

#[test]
fn migrate_ingest_and_show_run() {
    let db = temp_path("flow", "sqlite3");
    let db_arg = db.display().to_string();

    let event_path = temp_path("event", "json");
    fs::write(
        &event_path,
        r#"{
            "portalRunId": "2024111144ce2633",
            "executionId": "icav2.id.12345",
            "timestamp": "2024-11-11T00:00:00Z",
            "status": "DRAFT",
            "workflowName": "rnasum",
            "workflowVersion": "1.0",
            "workflowRunName": "run1",
            "linkedLibraries": [
                {"orcabusId": "lib.01J5M2J44HFJ9424G7074NKTGN", "libraryId": "L000001"}
            ],
            "payload": {"version": "0.1.0", "data": {"dataset": "BRCA"}}
        }"#,
    )
    .unwrap_or_else(|err| panic!("failed to write event fixture: {err}"));
    let event_arg = event_path.display().to_string();

    assert!(run(&["runledger", "--db", &db_arg, "migrate"]).is_ok());
    assert!(run(&[
        "runledger",
        "--db",
        &db_arg,
        "ingest",
        "--file",
        &event_arg
    ])
    .is_ok());

    let store = SqliteRunStore::open(&db)
        .unwrap_or_else(|err| panic!("failed to reopen store: {err}"));
    let workflow_run = store
        .get_run("2024111144ce2633")
        .unwrap_or_else(|err| panic!("run lookup failed: {err}"))
        .unwrap_or_else(|| panic!("ingest did not create the run"));
    let states = store
        .list_states(workflow_run.workflow_run_id)
        .unwrap_or_else(|err| panic!("state lookup failed: {err}"));
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, Status::Draft);
    let libraries = store
        .list_linked_libraries(workflow_run.workflow_run_id)
        .unwrap_or_else(|err| panic!("library lookup failed: {err}"));
    assert_eq!(libraries.len(), 1);
    assert_eq!(libraries[0].orcabus_id, "01J5M2J44HFJ9424G7074NKTGN");
    drop(store);

    assert!(run(&["runledger", "--db", &db_arg, "list-runs"]).is_ok());
    assert!(run(&[
        "runledger",
        "--db",
        &db_arg,
        "show-run",
        "--portal-run-id",
        "2024111144ce2633"
    ])
    .is_ok());
    assert!(run(&[
        "runledger",
        "--db",
        &db_arg,
        "show-run",
        "--portal-run-id",
        "does-not-exist"
    ])
    .is_err());
}

#[test]
fn rerun_command_builds_a_new_event() {
    let db = temp_path("rerun", "sqlite3");
    let db_arg = db.display().to_string();

    let event_path = temp_path("rerun-event", "json");
    fs::write(
        &event_path,
        r#"{
            "portalRunId": "202405012397gatc",
            "timestamp": "2025-05-01T09:25:44Z",
            "status": "DRAFT",
            "workflowName": "ctTSO500",
            "workflowVersion": "4.2.7",
            "workflowRunName": "ctTSO500-L000002",
            "payload": {"version": "0.1.0", "data": {"outputUri": "s3://bucket/202405012397gatc/"}}
        }"#,
    )
    .unwrap_or_else(|err| panic!("failed to write event fixture: {err}"));
    let event_arg = event_path.display().to_string();

    assert!(run(&[
        "runledger",
        "--db",
        &db_arg,
        "ingest",
        "--file",
        &event_arg
    ])
    .is_ok());
    assert!(run(&[
        "runledger",
        "--db",
        &db_arg,
        "rerun",
        "--portal-run-id",
        "202405012397gatc",
        "--ingest"
    ])
    .is_ok());

    let store = SqliteRunStore::open(&db)
        .unwrap_or_else(|err| panic!("failed to reopen store: {err}"));
    let runs = store
        .list_runs()
        .unwrap_or_else(|err| panic!("run listing failed: {err}"));
    assert_eq!(runs.len(), 2);
}
