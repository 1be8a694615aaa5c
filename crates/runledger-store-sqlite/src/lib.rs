#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use time::OffsetDateTime;
use ulid::Ulid;
use uuid::Uuid;

use runledger_domain::{
    LibraryAssociationRecord, LibraryRecord, PayloadId, PayloadRecord, PortalRunId, StateId,
    StateRecord, Status, WorkflowId, WorkflowRecord, WorkflowRunId, WorkflowRunRecord,
};

const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow (
  workflow_id TEXT PRIMARY KEY,
  workflow_name TEXT NOT NULL,
  workflow_version TEXT NOT NULL,
  execution_engine TEXT NOT NULL,
  execution_engine_pipeline_id TEXT NOT NULL,
  approval_state TEXT,
  UNIQUE(workflow_name, workflow_version)
);

CREATE TABLE IF NOT EXISTS workflow_run (
  workflow_run_id TEXT PRIMARY KEY,
  portal_run_id TEXT NOT NULL UNIQUE,
  workflow_id TEXT NOT NULL,
  execution_id TEXT,
  workflow_run_name TEXT NOT NULL,
  comment TEXT,
  analysis_run_id TEXT,
  FOREIGN KEY (workflow_id) REFERENCES workflow(workflow_id)
);

CREATE TABLE IF NOT EXISTS library (
  orcabus_id TEXT PRIMARY KEY,
  library_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS library_association (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  workflow_run_id TEXT NOT NULL,
  library_orcabus_id TEXT NOT NULL,
  association_date TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'ACTIVE',
  UNIQUE(workflow_run_id, library_orcabus_id),
  FOREIGN KEY (workflow_run_id) REFERENCES workflow_run(workflow_run_id),
  FOREIGN KEY (library_orcabus_id) REFERENCES library(orcabus_id)
);

CREATE TABLE IF NOT EXISTS payload (
  payload_id TEXT PRIMARY KEY,
  payload_ref_id TEXT NOT NULL UNIQUE,
  version TEXT NOT NULL,
  data TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS state (
  state_id TEXT PRIMARY KEY,
  workflow_run_id TEXT NOT NULL,
  status TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  comment TEXT,
  payload_id TEXT,
  UNIQUE(workflow_run_id, status, timestamp),
  FOREIGN KEY (workflow_run_id) REFERENCES workflow_run(workflow_run_id),
  FOREIGN KEY (payload_id) REFERENCES payload(payload_id)
);

CREATE INDEX IF NOT EXISTS idx_state_run_timestamp ON state(workflow_run_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_workflow_run_workflow ON workflow_run(workflow_id);
CREATE INDEX IF NOT EXISTS idx_association_library ON library_association(library_orcabus_id);

CREATE TRIGGER IF NOT EXISTS trg_state_update_draft_only
BEFORE UPDATE ON state
WHEN OLD.status <> 'DRAFT'
BEGIN
  SELECT RAISE(FAIL, 'state history is immutable past DRAFT');
END;

CREATE TRIGGER IF NOT EXISTS trg_state_no_delete
BEFORE DELETE ON state
BEGIN
  SELECT RAISE(FAIL, 'state history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_payload_no_update
BEFORE UPDATE ON payload
BEGIN
  SELECT RAISE(FAIL, 'payload is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_payload_no_delete
BEFORE DELETE ON payload
BEGIN
  SELECT RAISE(FAIL, 'payload is append-only');
END;
";

/// Relational entity store for run-lifecycle records.
///
/// All writes go through [`SqliteRunStore::transaction`]; a reconciliation
/// pass owns exactly one transaction, so a crash mid-sequence cannot leave
/// a run without its state or a payload without its state.
pub struct SqliteRunStore {
    conn: Connection,
}

impl SqliteRunStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply run store schema")?;

        let now = rfc3339(runledger_domain::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STORE_SCHEMA_VERSION, now],
            )
            .context("failed to record store migration")?;

        Ok(())
    }

    pub fn transaction(&mut self) -> Result<RunStoreTx<'_>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start store transaction")?;
        Ok(RunStoreTx { tx })
    }

    pub fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowRecord>> {
        query_workflow_by_id(&self.conn, workflow_id)
    }

    pub fn get_workflow_by_identity(
        &self,
        workflow_name: &str,
        workflow_version: &str,
    ) -> Result<Option<WorkflowRecord>> {
        query_workflow_by_identity(&self.conn, workflow_name, workflow_version)
    }

    pub fn get_run(&self, portal_run_id: &str) -> Result<Option<WorkflowRunRecord>> {
        query_run(&self.conn, portal_run_id)
    }

    pub fn list_runs(&self) -> Result<Vec<WorkflowRunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT workflow_run_id, portal_run_id, workflow_id, execution_id,
                    workflow_run_name, comment, analysis_run_id
             FROM workflow_run
             ORDER BY portal_run_id ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(run_from_row(row)?);
        }
        Ok(out)
    }

    pub fn list_states(&self, workflow_run_id: WorkflowRunId) -> Result<Vec<StateRecord>> {
        query_states(&self.conn, workflow_run_id)
    }

    pub fn list_linked_libraries(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> Result<Vec<LibraryRecord>> {
        query_linked_libraries(&self.conn, workflow_run_id)
    }

    pub fn get_payload(&self, payload_id: PayloadId) -> Result<Option<PayloadRecord>> {
        query_payload(&self.conn, payload_id)
    }

    /// The payload attached to the run's most recent payload-carrying state.
    pub fn latest_payload_for_run(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> Result<Option<PayloadRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.payload_id, p.payload_ref_id, p.version, p.data
             FROM state s
             JOIN payload p ON p.payload_id = s.payload_id
             WHERE s.workflow_run_id = ?1 AND s.payload_id IS NOT NULL
             ORDER BY s.timestamp DESC
             LIMIT 1",
        )?;

        stmt.query_row(params![workflow_run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .optional()?
        .map(|(payload_id, payload_ref_id, version, data)| {
            Ok(PayloadRecord {
                payload_id: PayloadId(parse_ulid(&payload_id, "payload_id")?),
                payload_ref_id: parse_uuid(&payload_ref_id)?,
                version,
                data: serde_json::from_str(&data).context("invalid payload data JSON")?,
            })
        })
        .transpose()
    }
}

/// Transaction-scoped write surface. Dropping the value without calling
/// [`RunStoreTx::commit`] rolls everything back.
pub struct RunStoreTx<'a> {
    tx: Transaction<'a>,
}

impl RunStoreTx<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit store transaction")
    }

    pub fn find_workflow(
        &self,
        workflow_name: &str,
        workflow_version: &str,
    ) -> Result<Option<WorkflowRecord>> {
        query_workflow_by_identity(&self.tx, workflow_name, workflow_version)
    }

    pub fn insert_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO workflow(
                    workflow_id, workflow_name, workflow_version,
                    execution_engine, execution_engine_pipeline_id, approval_state
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    workflow.workflow_id.to_string(),
                    workflow.workflow_name,
                    workflow.workflow_version,
                    workflow.execution_engine,
                    workflow.execution_engine_pipeline_id,
                    workflow.approval_state,
                ],
            )
            .context("failed to insert workflow")?;
        Ok(())
    }

    pub fn find_workflow_by_id(&self, workflow_id: WorkflowId) -> Result<Option<WorkflowRecord>> {
        query_workflow_by_id(&self.tx, workflow_id)
    }

    pub fn find_run(&self, portal_run_id: &str) -> Result<Option<WorkflowRunRecord>> {
        query_run(&self.tx, portal_run_id)
    }

    pub fn list_linked_libraries(
        &self,
        workflow_run_id: WorkflowRunId,
    ) -> Result<Vec<LibraryRecord>> {
        query_linked_libraries(&self.tx, workflow_run_id)
    }

    pub fn insert_run(&self, run: &WorkflowRunRecord) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO workflow_run(
                    workflow_run_id, portal_run_id, workflow_id,
                    execution_id, workflow_run_name, comment, analysis_run_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.workflow_run_id.to_string(),
                    run.portal_run_id.as_str(),
                    run.workflow_id.to_string(),
                    run.execution_id,
                    run.workflow_run_name,
                    run.comment,
                    run.analysis_run_id,
                ],
            )
            .context("failed to insert workflow run")?;
        Ok(())
    }

    pub fn find_library(&self, orcabus_id: &str) -> Result<Option<LibraryRecord>> {
        let mut stmt = self
            .tx
            .prepare("SELECT orcabus_id, library_id FROM library WHERE orcabus_id = ?1")?;
        stmt.query_row(params![orcabus_id], |row| {
            Ok(LibraryRecord {
                orcabus_id: row.get(0)?,
                library_id: row.get(1)?,
            })
        })
        .optional()
        .context("failed to look up library")
    }

    pub fn insert_library(&self, library: &LibraryRecord) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO library(orcabus_id, library_id) VALUES (?1, ?2)",
                params![library.orcabus_id, library.library_id],
            )
            .context("failed to insert library")?;
        Ok(())
    }

    pub fn insert_association(&self, association: &LibraryAssociationRecord) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO library_association(
                    workflow_run_id, library_orcabus_id, association_date, status
                ) VALUES (?1, ?2, ?3, ?4)",
                params![
                    association.workflow_run_id.to_string(),
                    association.library_orcabus_id,
                    rfc3339(association.association_date)?,
                    association.status,
                ],
            )
            .context("failed to insert library association")?;
        Ok(())
    }

    pub fn list_states(&self, workflow_run_id: WorkflowRunId) -> Result<Vec<StateRecord>> {
        query_states(&self.tx, workflow_run_id)
    }

    pub fn insert_payload(&self, payload: &PayloadRecord) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO payload(payload_id, payload_ref_id, version, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    payload.payload_id.to_string(),
                    payload.payload_ref_id.to_string(),
                    payload.version,
                    serde_json::to_string(&payload.data)
                        .context("failed to serialize payload data")?,
                ],
            )
            .context("failed to insert payload")?;
        Ok(())
    }

    pub fn insert_state(&self, state: &StateRecord) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO state(
                    state_id, workflow_run_id, status, timestamp, comment, payload_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    state.state_id.to_string(),
                    state.workflow_run_id.to_string(),
                    state.status.as_str(),
                    rfc3339(state.timestamp)?,
                    state.comment,
                    state.payload_id.map(|id| id.to_string()),
                ],
            )
            .context("failed to insert state")?;
        Ok(())
    }

    /// Refreshes the single draft row of a run in place. The schema trigger
    /// rejects updates of any non-DRAFT row.
    pub fn update_draft_state(
        &self,
        state_id: StateId,
        timestamp: OffsetDateTime,
        comment: Option<&str>,
        payload_id: Option<PayloadId>,
    ) -> Result<()> {
        let updated = self
            .tx
            .execute(
                "UPDATE state SET timestamp = ?2, comment = ?3, payload_id = ?4
                 WHERE state_id = ?1",
                params![
                    state_id.to_string(),
                    rfc3339(timestamp)?,
                    comment,
                    payload_id.map(|id| id.to_string()),
                ],
            )
            .context("failed to update draft state")?;

        if updated != 1 {
            return Err(anyhow!("draft state {state_id} not found for update"));
        }
        Ok(())
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(())
}

fn query_workflow_by_identity(
    conn: &Connection,
    workflow_name: &str,
    workflow_version: &str,
) -> Result<Option<WorkflowRecord>> {
    let mut stmt = conn.prepare(
        "SELECT workflow_id, workflow_name, workflow_version,
                execution_engine, execution_engine_pipeline_id, approval_state
         FROM workflow
         WHERE workflow_name = ?1 AND workflow_version = ?2",
    )?;

    stmt.query_row(params![workflow_name, workflow_version], workflow_columns)
        .optional()?
        .map(workflow_from_columns)
        .transpose()
}

fn query_workflow_by_id(
    conn: &Connection,
    workflow_id: WorkflowId,
) -> Result<Option<WorkflowRecord>> {
    let mut stmt = conn.prepare(
        "SELECT workflow_id, workflow_name, workflow_version,
                execution_engine, execution_engine_pipeline_id, approval_state
         FROM workflow
         WHERE workflow_id = ?1",
    )?;

    stmt.query_row(params![workflow_id.to_string()], workflow_columns)
        .optional()?
        .map(workflow_from_columns)
        .transpose()
}

type WorkflowColumns = (String, String, String, String, String, Option<String>);

fn workflow_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn workflow_from_columns(columns: WorkflowColumns) -> Result<WorkflowRecord> {
    let (workflow_id, workflow_name, workflow_version, engine, pipeline_id, approval_state) =
        columns;
    Ok(WorkflowRecord {
        workflow_id: WorkflowId(parse_ulid(&workflow_id, "workflow_id")?),
        workflow_name,
        workflow_version,
        execution_engine: engine,
        execution_engine_pipeline_id: pipeline_id,
        approval_state,
    })
}

fn query_run(conn: &Connection, portal_run_id: &str) -> Result<Option<WorkflowRunRecord>> {
    let mut stmt = conn.prepare(
        "SELECT workflow_run_id, portal_run_id, workflow_id, execution_id,
                workflow_run_name, comment, analysis_run_id
         FROM workflow_run
         WHERE portal_run_id = ?1",
    )?;

    let mut rows = stmt.query(params![portal_run_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(run_from_row(row)?)),
        None => Ok(None),
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> Result<WorkflowRunRecord> {
    let workflow_run_id: String = row.get(0)?;
    let portal_run_id: String = row.get(1)?;
    let workflow_id: String = row.get(2)?;
    Ok(WorkflowRunRecord {
        workflow_run_id: WorkflowRunId(parse_ulid(&workflow_run_id, "workflow_run_id")?),
        portal_run_id: PortalRunId::new(&portal_run_id)
            .map_err(|err| anyhow!("invalid stored portal_run_id: {err}"))?,
        workflow_id: WorkflowId(parse_ulid(&workflow_id, "workflow_id")?),
        execution_id: row.get(3)?,
        workflow_run_name: row.get(4)?,
        comment: row.get(5)?,
        analysis_run_id: row.get(6)?,
    })
}

fn query_states(conn: &Connection, workflow_run_id: WorkflowRunId) -> Result<Vec<StateRecord>> {
    let mut stmt = conn.prepare(
        "SELECT state_id, workflow_run_id, status, timestamp, comment, payload_id
         FROM state
         WHERE workflow_run_id = ?1
         ORDER BY timestamp ASC",
    )?;

    let mut rows = stmt.query(params![workflow_run_id.to_string()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let state_id: String = row.get(0)?;
        let run_id: String = row.get(1)?;
        let status: String = row.get(2)?;
        let timestamp: String = row.get(3)?;
        let payload_id: Option<String> = row.get(5)?;
        out.push(StateRecord {
            state_id: StateId(parse_ulid(&state_id, "state_id")?),
            workflow_run_id: WorkflowRunId(parse_ulid(&run_id, "workflow_run_id")?),
            status: Status::normalize(&status),
            timestamp: parse_rfc3339(&timestamp)?,
            comment: row.get(4)?,
            payload_id: payload_id
                .map(|value| Ok::<_, anyhow::Error>(PayloadId(parse_ulid(&value, "payload_id")?)))
                .transpose()?,
        });
    }
    Ok(out)
}

fn query_linked_libraries(
    conn: &Connection,
    workflow_run_id: WorkflowRunId,
) -> Result<Vec<LibraryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT l.orcabus_id, l.library_id
         FROM library_association a
         JOIN library l ON l.orcabus_id = a.library_orcabus_id
         WHERE a.workflow_run_id = ?1
         ORDER BY l.library_id ASC",
    )?;

    let mut rows = stmt.query(params![workflow_run_id.to_string()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(LibraryRecord {
            orcabus_id: row.get(0)?,
            library_id: row.get(1)?,
        });
    }
    Ok(out)
}

fn query_payload(conn: &Connection, payload_id: PayloadId) -> Result<Option<PayloadRecord>> {
    let mut stmt = conn.prepare(
        "SELECT payload_id, payload_ref_id, version, data FROM payload WHERE payload_id = ?1",
    )?;

    stmt.query_row(params![payload_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })
    .optional()?
    .map(|(id, ref_id, version, data)| {
        Ok(PayloadRecord {
            payload_id: PayloadId(parse_ulid(&id, "payload_id")?),
            payload_ref_id: parse_uuid(&ref_id)?,
            version,
            data: serde_json::from_str(&data).context("invalid payload data JSON")?,
        })
    })
    .transpose()
}

fn parse_ulid(value: &str, field: &str) -> Result<Ulid> {
    Ulid::from_str(value).map_err(|err| anyhow!("invalid {field} ULID: {err}"))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::from_str(value).map_err(|err| anyhow!("invalid payload_ref_id UUID: {err}"))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}
