#![forbid(unsafe_code)]

//! Operational command surface over the run ledger.
//!
//! The binary is a thin shim; [`run_cli`] is the embeddable entrypoint so
//! host runtimes and tests can drive the same command set directly.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};

use runledger_domain::{format_rfc3339, now_utc, RunStateHistory};
use runledger_events::{OutboundEnvelope, RunKind, RunStateChange};
use runledger_reconcile::{EventSink, LookupPolicy, Reconciler, ReconcilerConfig};
use runledger_store_sqlite::SqliteRunStore;

#[derive(Debug, Parser)]
#[command(name = "runledger")]
#[command(about = "Run-lifecycle ledger: ingest state-change events, inspect runs")]
pub struct Cli {
    #[arg(long, default_value = "./runledger.sqlite3")]
    db: PathBuf,

    /// Reject events naming workflows that are not pre-registered.
    #[arg(long, default_value_t = false)]
    fail_closed: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply the store schema (idempotent).
    Migrate,
    /// Ingest one run-state-change event and print the outbound envelope.
    Ingest(IngestArgs),
    /// List known runs with their current status.
    ListRuns,
    /// Show one run with its full state history and library links.
    ShowRun(ShowRunArgs),
    /// Mark a FAILED run as RESOLVED (requires a comment).
    Resolve(ResolveArgs),
    /// Construct a READY rerun event from an existing run.
    Rerun(RerunArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Path to the event JSON; reads stdin when omitted.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Which run family the event belongs to.
    #[arg(long, value_enum, default_value_t = KindArg::Workflow)]
    kind: KindArg,
}

#[derive(Debug, Args)]
pub struct ShowRunArgs {
    #[arg(long)]
    portal_run_id: String,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    #[arg(long)]
    portal_run_id: String,

    #[arg(long)]
    comment: String,

    #[arg(long, value_enum, default_value_t = KindArg::Workflow)]
    kind: KindArg,
}

#[derive(Debug, Args)]
pub struct RerunArgs {
    #[arg(long)]
    portal_run_id: String,

    /// Also feed the constructed event straight back through ingest.
    #[arg(long, default_value_t = false)]
    ingest: bool,

    #[arg(long, value_enum, default_value_t = KindArg::Workflow)]
    kind: KindArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Workflow,
    Sequence,
    Case,
}

impl From<KindArg> for RunKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Workflow => Self::Workflow,
            KindArg::Sequence => Self::Sequence,
            KindArg::Case => Self::Case,
        }
    }
}

/// Sink that pretty-prints outbound envelopes to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn publish(&mut self, envelope: &OutboundEnvelope) -> Result<()> {
        println!(
            "{}",
            serde_json::to_string_pretty(envelope).context("failed to render envelope")?
        );
        Ok(())
    }
}

/// Executes a parsed command line.
///
/// # Errors
/// Returns an error for unreadable input, malformed events, and store or
/// reconciliation failures. A transition rejection is not an error: the
/// command reports the drop and exits cleanly.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteRunStore::open(&cli.db)?;
    store.migrate()?;

    let workflow_lookup = if cli.fail_closed {
        LookupPolicy::FailClosed
    } else {
        LookupPolicy::CreateOnTheFly
    };

    match cli.command {
        Command::Migrate => {
            println!("schema up to date at {}", cli.db.display());
            Ok(())
        }
        Command::Ingest(args) => {
            let reconciler = reconciler_for(args.kind, workflow_lookup);
            let event = read_event(args.file.as_deref())?;
            match reconciler.process_event(&mut store, &event)? {
                Some(envelope) => StdoutSink.publish(&envelope),
                None => {
                    eprintln!(
                        "event for run {} dropped (non-advancing state change)",
                        event.portal_run_id
                    );
                    Ok(())
                }
            }
        }
        Command::ListRuns => {
            let mut out = Vec::new();
            for run in store.list_runs()? {
                let history = RunStateHistory::new(store.list_states(run.workflow_run_id)?);
                let current = history
                    .latest()
                    .map(|state| state.status.as_str().to_string());
                out.push(json!({
                    "portalRunId": run.portal_run_id.to_string(),
                    "workflowRunName": run.workflow_run_name,
                    "currentStatus": current,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Command::ShowRun(args) => {
            let report = show_run(&store, &args.portal_run_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Resolve(args) => {
            let reconciler = reconciler_for(args.kind, workflow_lookup);
            match reconciler.resolve_run(
                &mut store,
                &args.portal_run_id,
                &args.comment,
                now_utc(),
            )? {
                Some(envelope) => StdoutSink.publish(&envelope),
                None => {
                    eprintln!("resolution for run {} not applied", args.portal_run_id);
                    Ok(())
                }
            }
        }
        Command::Rerun(args) => {
            let reconciler = reconciler_for(args.kind, workflow_lookup);
            let rerun = reconciler.build_rerun_event(&store, &args.portal_run_id, now_utc())?;
            println!("{}", serde_json::to_string_pretty(&rerun.to_json()?)?);

            if args.ingest {
                match reconciler.process_event(&mut store, &rerun)? {
                    Some(envelope) => StdoutSink.publish(&envelope)?,
                    None => eprintln!(
                        "rerun event for run {} dropped (non-advancing state change)",
                        rerun.portal_run_id
                    ),
                }
            }
            Ok(())
        }
    }
}

fn reconciler_for(kind: KindArg, workflow_lookup: LookupPolicy) -> Reconciler {
    Reconciler::new(ReconcilerConfig {
        run_kind: kind.into(),
        workflow_lookup,
        library_lookup: LookupPolicy::CreateOnTheFly,
    })
}

fn read_event(file: Option<&std::path::Path>) -> Result<RunStateChange> {
    let body = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read event from {}", path.display()))?,
        None => {
            let mut body = String::new();
            std::io::stdin()
                .read_to_string(&mut body)
                .context("failed to read event from stdin")?;
            body
        }
    };

    let raw: Value = serde_json::from_str(&body).context("event is not valid JSON")?;
    Ok(RunStateChange::from_json(&raw)?)
}

fn show_run(store: &SqliteRunStore, portal_run_id: &str) -> Result<Value> {
    let run = store
        .get_run(portal_run_id)?
        .with_context(|| format!("no run with portal run id {portal_run_id}"))?;
    let workflow = store
        .get_workflow(run.workflow_id)?
        .with_context(|| format!("workflow row missing for run {portal_run_id}"))?;
    let libraries = store.list_linked_libraries(run.workflow_run_id)?;
    let states = store.list_states(run.workflow_run_id)?;

    let mut state_rows = Vec::new();
    for state in states {
        state_rows.push(json!({
            "status": state.status.as_str(),
            "timestamp": format_rfc3339(state.timestamp)?,
            "comment": state.comment,
            "payloadId": state.payload_id.map(|id| id.to_string()),
        }));
    }

    Ok(json!({
        "portalRunId": run.portal_run_id.to_string(),
        "workflowRunName": run.workflow_run_name,
        "executionId": run.execution_id,
        "workflow": {
            "workflowName": workflow.workflow_name,
            "workflowVersion": workflow.workflow_version,
            "executionEngine": workflow.execution_engine,
        },
        "linkedLibraries": libraries
            .iter()
            .map(|library| json!({
                "orcabusId": library.orcabus_id,
                "libraryId": library.library_id,
            }))
            .collect::<Vec<_>>(),
        "states": state_rows,
    }))
}
