#![forbid(unsafe_code)]

//! Idempotent event-to-entity reconciliation.
//!
//! One inbound state-change event is processed inside one store
//! transaction: find-or-create the workflow and run, link libraries on the
//! run-creation branch only, let the transition policy rule on the proposed
//! state, and persist payload-then-state on acceptance. A rejected
//! transition is normal control flow: the event is dropped with a log line
//! and no outbound event is produced.

use anyhow::{anyhow, Context, Result};
use time::OffsetDateTime;
use uuid::Uuid;

use runledger_domain::{
    format_rfc3339, now_utc, parse_rfc3339_utc, sanitize_orcabus_id, Decision,
    LibraryAssociationRecord, LibraryRecord, PayloadRecord, PortalRunId, ProposedState,
    RunStateHistory, StateId, StateRecord, Status, WorkflowId, WorkflowRecord, WorkflowRunId,
    WorkflowRunRecord, ASSOCIATION_STATUS_ACTIVE,
};
use runledger_events::{
    EventPayload, LinkedLibrary, OutboundEnvelope, RunKind, RunStateChange,
};
use runledger_store_sqlite::{RunStoreTx, SqliteRunStore};

/// Placeholder engine metadata for workflows created on the fly.
pub const UNKNOWN_EXECUTION_ENGINE: &str = "Unknown";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("unknown workflow {workflow_name}:{workflow_version} (lookup is fail-closed)")]
    UnknownWorkflow {
        workflow_name: String,
        workflow_version: String,
    },
    #[error("unknown library {orcabus_id} (lookup is fail-closed)")]
    UnknownLibrary { orcabus_id: String },
    #[error("library {orcabus_id} already registered as {stored}, event says {given}")]
    LibraryMismatch {
        orcabus_id: String,
        stored: String,
        given: String,
    },
    #[error("no workflow run with portal run id {portal_run_id}")]
    UnknownRun { portal_run_id: String },
    #[error("run cannot be resolved from status {current}")]
    InvalidResolution { current: String },
    #[error("a resolution comment MUST be provided")]
    EmptyComment,
}

/// Whether unknown identities encountered in events are registered on the
/// fly or rejected. On-the-fly creation matches the observed upstream
/// behavior while pre-registration is still rolling out.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum LookupPolicy {
    #[default]
    CreateOnTheFly,
    FailClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub run_kind: RunKind,
    pub workflow_lookup: LookupPolicy,
    pub library_lookup: LookupPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            run_kind: RunKind::Workflow,
            workflow_lookup: LookupPolicy::default(),
            library_lookup: LookupPolicy::default(),
        }
    }
}

/// Outbound publish capability. The reconciler itself never publishes; it
/// returns the mapped envelope and callers push it through a sink.
pub trait EventSink {
    #[allow(clippy::missing_errors_doc)]
    fn publish(&mut self, envelope: &OutboundEnvelope) -> Result<()>;
}

/// Test/support sink that keeps everything it is given.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub published: Vec<OutboundEnvelope>,
}

impl EventSink for CollectingSink {
    fn publish(&mut self, envelope: &OutboundEnvelope) -> Result<()> {
        self.published.push(envelope.clone());
        Ok(())
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(config: ReconcilerConfig) -> Self {
        Self { config }
    }

    /// Reconciles one inbound state-change event against the store.
    ///
    /// Returns `Ok(Some(envelope))` when a state was persisted and
    /// `Ok(None)` when the transition policy dropped the event.
    ///
    /// # Errors
    /// Propagates event validation failures, fail-closed lookup misses,
    /// library identity mismatches, and persistence failures. Everything
    /// written in this call is rolled back on error.
    pub fn process_event(
        &self,
        store: &mut SqliteRunStore,
        event: &RunStateChange,
    ) -> Result<Option<OutboundEnvelope>> {
        event.validate()?;
        let timestamp = parse_rfc3339_utc(&event.timestamp)?;
        let status = Status::normalize(&event.status);

        let tx = store.transaction()?;

        let workflow = self.find_or_create_workflow(&tx, event)?;
        let run = self.find_or_create_run(&tx, event, workflow.workflow_id)?;

        let history = RunStateHistory::new(tx.list_states(run.workflow_run_id)?);
        let proposed = ProposedState {
            status: status.clone(),
            timestamp,
            comment: None,
        };

        let payload_ref_id = match history.evaluate(&proposed) {
            Decision::Reject(reason) => {
                log::info!(
                    "dropping state change for run {}: {reason}",
                    event.portal_run_id
                );
                // Dropping the transaction discards anything created above.
                return Ok(None);
            }
            Decision::PersistWithWarning => {
                log::warn!(
                    "run {} has no state history but first state is {status}; persisting anyway",
                    event.portal_run_id
                );
                persist_state(&tx, &run, &proposed, event.payload.as_ref(), None)?
            }
            Decision::UpdateDraft => {
                let draft = history
                    .latest()
                    .ok_or_else(|| anyhow!("draft update without an existing draft state"))?;
                persist_state(
                    &tx,
                    &run,
                    &proposed,
                    event.payload.as_ref(),
                    Some(draft.state_id),
                )?
            }
            Decision::Persist => persist_state(&tx, &run, &proposed, event.payload.as_ref(), None)?,
        };

        tx.commit()?;
        let detail = map_outbound(event, &status, payload_ref_id);
        Ok(Some(OutboundEnvelope::new(self.config.run_kind, detail)))
    }

    /// Applies a human-curated FAILED to RESOLVED transition.
    ///
    /// # Errors
    /// Fails when the comment is empty, the run is unknown, or the run's
    /// latest state is not FAILED.
    pub fn resolve_run(
        &self,
        store: &mut SqliteRunStore,
        portal_run_id: &str,
        comment: &str,
        timestamp: OffsetDateTime,
    ) -> Result<Option<OutboundEnvelope>> {
        if comment.trim().is_empty() {
            return Err(ReconcileError::EmptyComment.into());
        }

        let tx = store.transaction()?;
        let run = tx
            .find_run(portal_run_id)?
            .ok_or_else(|| ReconcileError::UnknownRun {
                portal_run_id: portal_run_id.to_string(),
            })?;

        let history = RunStateHistory::new(tx.list_states(run.workflow_run_id)?);
        let current = history
            .latest()
            .map(|state| state.status.clone())
            .ok_or_else(|| ReconcileError::InvalidResolution {
                current: "no state".to_string(),
            })?;
        if current != Status::Failed {
            return Err(ReconcileError::InvalidResolution {
                current: current.as_str().to_string(),
            }
            .into());
        }

        let proposed = ProposedState {
            status: Status::Resolved,
            timestamp,
            comment: Some(comment.to_string()),
        };
        if let Decision::Reject(reason) = history.evaluate(&proposed) {
            log::info!("resolution for run {portal_run_id} not applied: {reason}");
            return Ok(None);
        }

        tx.insert_state(&StateRecord {
            state_id: StateId::new(),
            workflow_run_id: run.workflow_run_id,
            status: Status::Resolved,
            timestamp,
            comment: Some(comment.to_string()),
            payload_id: None,
        })?;

        let workflow = tx
            .find_workflow_by_id(run.workflow_id)?
            .ok_or_else(|| anyhow!("workflow row missing for run {portal_run_id}"))?;
        let libraries = tx.list_linked_libraries(run.workflow_run_id)?;
        tx.commit()?;

        let detail = RunStateChange {
            portal_run_id: run.portal_run_id.to_string(),
            timestamp: format_rfc3339(timestamp)?,
            status: Status::Resolved.as_str().to_string(),
            workflow_name: workflow.workflow_name,
            workflow_version: workflow.workflow_version,
            workflow_run_name: run.workflow_run_name.clone(),
            execution_id: run.execution_id.clone(),
            linked_libraries: linked_libraries_from_records(&libraries),
            payload: None,
        };
        Ok(Some(OutboundEnvelope::new(self.config.run_kind, detail)))
    }

    /// Constructs a READY rerun event from an existing run: fresh portal
    /// run id, stored library links, and the latest payload with every
    /// occurrence of the old portal run id rewritten to the new one.
    ///
    /// The caller feeds the result back through [`Reconciler::process_event`].
    ///
    /// # Errors
    /// Fails when the run is unknown or the stored payload cannot be
    /// rewritten.
    pub fn build_rerun_event(
        &self,
        store: &SqliteRunStore,
        portal_run_id: &str,
        now: OffsetDateTime,
    ) -> Result<RunStateChange> {
        let run = store
            .get_run(portal_run_id)?
            .ok_or_else(|| ReconcileError::UnknownRun {
                portal_run_id: portal_run_id.to_string(),
            })?;
        let workflow = store
            .get_workflow(run.workflow_id)?
            .ok_or_else(|| anyhow!("workflow row missing for run {portal_run_id}"))?;
        let libraries = store.list_linked_libraries(run.workflow_run_id)?;
        let payload = store.latest_payload_for_run(run.workflow_run_id)?;

        let new_portal_run_id = PortalRunId::generate(now);

        let payload = payload
            .map(|stored| -> Result<EventPayload> {
                let rendered = serde_json::to_string(&stored.data)
                    .context("failed to serialize stored payload")?;
                let rewritten = rendered.replace(portal_run_id, new_portal_run_id.as_str());
                Ok(EventPayload {
                    ref_id: None,
                    version: stored.version,
                    data: serde_json::from_str(&rewritten)
                        .context("failed to rewrite payload for rerun")?,
                })
            })
            .transpose()?;

        Ok(RunStateChange {
            portal_run_id: new_portal_run_id.to_string(),
            timestamp: format_rfc3339(now)?,
            status: Status::Ready.as_str().to_string(),
            workflow_name: workflow.workflow_name,
            workflow_version: workflow.workflow_version,
            workflow_run_name: run.workflow_run_name,
            execution_id: None,
            linked_libraries: linked_libraries_from_records(&libraries),
            payload,
        })
    }

    fn find_or_create_workflow(
        &self,
        tx: &RunStoreTx<'_>,
        event: &RunStateChange,
    ) -> Result<WorkflowRecord> {
        if let Some(workflow) = tx.find_workflow(&event.workflow_name, &event.workflow_version)? {
            return Ok(workflow);
        }

        match self.config.workflow_lookup {
            LookupPolicy::CreateOnTheFly => {
                log::warn!(
                    "no workflow record for {}:{}; creating on the fly",
                    event.workflow_name,
                    event.workflow_version
                );
                let workflow = WorkflowRecord {
                    workflow_id: WorkflowId::new(),
                    workflow_name: event.workflow_name.clone(),
                    workflow_version: event.workflow_version.clone(),
                    execution_engine: UNKNOWN_EXECUTION_ENGINE.to_string(),
                    execution_engine_pipeline_id: UNKNOWN_EXECUTION_ENGINE.to_string(),
                    approval_state: None,
                };
                tx.insert_workflow(&workflow)?;
                Ok(workflow)
            }
            LookupPolicy::FailClosed => Err(ReconcileError::UnknownWorkflow {
                workflow_name: event.workflow_name.clone(),
                workflow_version: event.workflow_version.clone(),
            }
            .into()),
        }
    }

    fn find_or_create_run(
        &self,
        tx: &RunStoreTx<'_>,
        event: &RunStateChange,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowRunRecord> {
        if let Some(run) = tx.find_run(&event.portal_run_id)? {
            return Ok(run);
        }

        let run = WorkflowRunRecord {
            workflow_run_id: WorkflowRunId::new(),
            portal_run_id: PortalRunId::new(&event.portal_run_id)?,
            workflow_id,
            execution_id: event.execution_id.clone(),
            workflow_run_name: event.workflow_run_name.clone(),
            comment: None,
            analysis_run_id: None,
        };
        tx.insert_run(&run)?;

        // Library links are established at run creation time only; later
        // events never re-link.
        if let Some(libraries) = &event.linked_libraries {
            self.link_libraries(tx, run.workflow_run_id, libraries)?;
        }

        Ok(run)
    }

    fn link_libraries(
        &self,
        tx: &RunStoreTx<'_>,
        workflow_run_id: WorkflowRunId,
        libraries: &[LinkedLibrary],
    ) -> Result<()> {
        let association_date = now_utc();
        for entry in libraries {
            let orcabus_id = sanitize_orcabus_id(&entry.orcabus_id);
            let library = match tx.find_library(&orcabus_id)? {
                Some(library) => {
                    if library.library_id != entry.library_id {
                        return Err(ReconcileError::LibraryMismatch {
                            orcabus_id,
                            stored: library.library_id,
                            given: entry.library_id.clone(),
                        }
                        .into());
                    }
                    library
                }
                None => match self.config.library_lookup {
                    LookupPolicy::CreateOnTheFly => {
                        // Library records are owned by the metadata sync;
                        // creating here covers ids seen before the sync lands.
                        let library = LibraryRecord {
                            orcabus_id: orcabus_id.clone(),
                            library_id: entry.library_id.clone(),
                        };
                        tx.insert_library(&library)?;
                        library
                    }
                    LookupPolicy::FailClosed => {
                        return Err(ReconcileError::UnknownLibrary { orcabus_id }.into());
                    }
                },
            };

            tx.insert_association(&LibraryAssociationRecord {
                workflow_run_id,
                library_orcabus_id: library.orcabus_id,
                association_date,
                status: ASSOCIATION_STATUS_ACTIVE.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Persists the accepted state (payload first, then the state row, or an
/// in-place draft refresh) and returns the minted payload reference, if any.
fn persist_state(
    tx: &RunStoreTx<'_>,
    run: &WorkflowRunRecord,
    proposed: &ProposedState,
    payload: Option<&EventPayload>,
    draft_to_update: Option<StateId>,
) -> Result<Option<Uuid>> {
    let payload_record = payload.map(|p| PayloadRecord::mint(&p.version, p.data.clone()));
    if let Some(record) = &payload_record {
        tx.insert_payload(record)?;
    }
    let payload_id = payload_record.as_ref().map(|record| record.payload_id);

    if let Some(state_id) = draft_to_update {
        tx.update_draft_state(
            state_id,
            proposed.timestamp,
            proposed.comment.as_deref(),
            payload_id,
        )?;
    } else {
        tx.insert_state(&StateRecord {
            state_id: StateId::new(),
            workflow_run_id: run.workflow_run_id,
            status: proposed.status.clone(),
            timestamp: proposed.timestamp,
            comment: proposed.comment.clone(),
            payload_id,
        })?;
    }

    Ok(payload_record.map(|record| record.payload_ref_id))
}

/// Maps the accepted inbound event back to its outbound form: status
/// re-normalized, `payload.refId` populated from the freshly minted
/// payload. Pure over its inputs.
fn map_outbound(
    event: &RunStateChange,
    status: &Status,
    payload_ref_id: Option<Uuid>,
) -> RunStateChange {
    RunStateChange {
        portal_run_id: event.portal_run_id.clone(),
        timestamp: event.timestamp.clone(),
        status: status.as_str().to_string(),
        workflow_name: event.workflow_name.clone(),
        workflow_version: event.workflow_version.clone(),
        workflow_run_name: event.workflow_run_name.clone(),
        execution_id: event.execution_id.clone(),
        linked_libraries: event.linked_libraries.clone(),
        payload: match (&event.payload, payload_ref_id) {
            (Some(payload), Some(ref_id)) => Some(EventPayload {
                ref_id: Some(ref_id.to_string()),
                version: payload.version.clone(),
                data: payload.data.clone(),
            }),
            _ => None,
        },
    }
}

fn linked_libraries_from_records(libraries: &[LibraryRecord]) -> Option<Vec<LinkedLibrary>> {
    if libraries.is_empty() {
        return None;
    }
    Some(
        libraries
            .iter()
            .map(|library| LinkedLibrary {
                orcabus_id: library.orcabus_id.clone(),
                library_id: library.library_id.clone(),
            })
            .collect(),
    )
}
