#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WorkflowId(pub Ulid);

impl WorkflowId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for WorkflowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WorkflowRunId(pub Ulid);

impl WorkflowRunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WorkflowRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for WorkflowRunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StateId(pub Ulid);

impl StateId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for StateId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PayloadId(pub Ulid);

impl PayloadId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PayloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PayloadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally assigned business key for one workflow execution, distinct
/// from the internal surrogate id.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PortalRunId(String);

impl PortalRunId {
    /// Wraps an externally supplied portal run id.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] when the value is empty or
    /// whitespace-only.
    pub fn new(value: &str) -> Result<Self, DomainError> {
        if value.trim().is_empty() {
            return Err(DomainError::Validation(
                "portal_run_id MUST be non-empty".to_string(),
            ));
        }
        Ok(Self(value.to_string()))
    }

    /// Mints a fresh portal run id: UTC date prefix plus the first eight hex
    /// characters of a random UUID.
    #[must_use]
    pub fn generate(now: OffsetDateTime) -> Self {
        let date = now.to_offset(UtcOffset::UTC).date();
        let token = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{:04}{:02}{:02}{}",
            date.year(),
            u8::from(date.month()),
            date.day(),
            &token[..8]
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PortalRunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const ORCABUS_ID_LENGTH: usize = 26;

/// Strips any dotted entity prefix (e.g. `lib.01J...`) from an externally
/// minted id, keeping the trailing 26-character ULID used for storage and
/// lookups. Events echo back the original text; only the store uses the
/// sanitized form.
#[must_use]
pub fn sanitize_orcabus_id(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= ORCABUS_ID_LENGTH {
        return raw.to_string();
    }
    chars[chars.len() - ORCABUS_ID_LENGTH..].iter().collect()
}

/// Controlled status vocabulary shared by every run family.
///
/// Statuses outside the controlled set pass through as [`Status::Other`]
/// with case-folded text; they participate in duplicate detection but have
/// no transition rules of their own.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Status {
    Draft,
    Ready,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Resolved,
    Other(String),
}

impl Status {
    /// Folds a free-text status to the controlled vocabulary: upper-case,
    /// hyphens to underscores, then alias resolution.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let folded = raw.trim().to_uppercase().replace('-', "_");
        match folded.as_str() {
            "DRAFT" | "INITIAL" | "CREATED" => Self::Draft,
            "READY" => Self::Ready,
            "RUNNING" | "IN_PROGRESS" | "ONGOING" => Self::Running,
            "SUCCEEDED" | "SUCCESS" | "DONE" => Self::Succeeded,
            "FAILED" | "FAILURE" | "FAIL" | "ERROR" => Self::Failed,
            "ABORTED" | "CANCELLED" | "CANCELED" => Self::Aborted,
            "RESOLVED" => Self::Resolved,
            _ => Self::Other(folded),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Draft => "DRAFT",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
            Self::Resolved => "RESOLVED",
            Self::Other(value) => value,
        }
    }

    #[must_use]
    pub fn is_draft(&self) -> bool {
        matches!(self, Self::Draft)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Terminal statuses are absorbing; only the explicit FAILED to
    /// RESOLVED manual edge leads past them.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkflowRecord {
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub workflow_version: String,
    pub execution_engine: String,
    pub execution_engine_pipeline_id: String,
    pub approval_state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkflowRunRecord {
    pub workflow_run_id: WorkflowRunId,
    pub portal_run_id: PortalRunId,
    pub workflow_id: WorkflowId,
    pub execution_id: Option<String>,
    pub workflow_run_name: String,
    pub comment: Option<String>,
    pub analysis_run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LibraryRecord {
    pub orcabus_id: String,
    pub library_id: String,
}

pub const ASSOCIATION_STATUS_ACTIVE: &str = "ACTIVE";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LibraryAssociationRecord {
    pub workflow_run_id: WorkflowRunId,
    pub library_orcabus_id: String,
    pub association_date: OffsetDateTime,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadRecord {
    pub payload_id: PayloadId,
    pub payload_ref_id: Uuid,
    pub version: String,
    pub data: Value,
}

impl PayloadRecord {
    /// Builds a payload row with server-minted ids; callers persist it
    /// before the state that references it.
    #[must_use]
    pub fn mint(version: &str, data: Value) -> Self {
        Self {
            payload_id: PayloadId::new(),
            payload_ref_id: Uuid::new_v4(),
            version: version.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateRecord {
    pub state_id: StateId,
    pub workflow_run_id: WorkflowRunId,
    pub status: Status,
    pub timestamp: OffsetDateTime,
    pub comment: Option<String>,
    pub payload_id: Option<PayloadId>,
}

/// A state proposed for a run, before the transition policy has ruled on it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedState {
    pub status: Status,
    pub timestamp: OffsetDateTime,
    pub comment: Option<String>,
}

/// Minimum gap between two persisted RUNNING heartbeats for the same run.
pub const RUNNING_HEARTBEAT_WINDOW: Duration = Duration::hours(1);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RejectReason {
    StaleTimestamp,
    TerminalState,
    InvalidFromDraft,
    NoGoingBack,
    DuplicateStatus,
    HeartbeatThrottled,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleTimestamp => "stale timestamp",
            Self::TerminalState => "run is in a terminal state",
            Self::InvalidFromDraft => "invalid transition out of DRAFT",
            Self::NoGoingBack => "cannot return to an earlier lifecycle state",
            Self::DuplicateStatus => "duplicate status",
            Self::HeartbeatThrottled => "RUNNING heartbeat inside throttle window",
        }
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of evaluating a proposed state against a run's history.
///
/// Rejection is normal control flow, not an error: callers drop the event
/// (with a log line) and move on.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Decision {
    /// Append the proposed state to the history.
    Persist,
    /// Append, but the run had no DRAFT first: legacy emitters skip it.
    /// Callers are expected to log a warning.
    PersistWithWarning,
    /// Refresh the existing draft row in place instead of appending.
    UpdateDraft,
    Reject(RejectReason),
}

impl Decision {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::Reject(_))
    }
}

/// A run's loaded state history plus the transition policy over it.
///
/// Pure: evaluation never touches storage, so the policy can be exercised
/// exhaustively without a database.
#[derive(Debug, Clone)]
pub struct RunStateHistory {
    states: Vec<StateRecord>,
}

impl RunStateHistory {
    #[must_use]
    pub fn new(states: Vec<StateRecord>) -> Self {
        Self { states }
    }

    /// The state with the greatest timestamp, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&StateRecord> {
        self.states
            .iter()
            .max_by_key(|state| state.timestamp)
    }

    #[must_use]
    pub fn contains_status(&self, status: &Status) -> bool {
        self.states.iter().any(|state| state.status == *status)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Applies the transition policy to a proposed state.
    #[must_use]
    pub fn evaluate(&self, proposed: &ProposedState) -> Decision {
        let Some(latest) = self.latest() else {
            // First state should be DRAFT, but some emitters never send one.
            return if proposed.status.is_draft() {
                Decision::Persist
            } else {
                Decision::PersistWithWarning
            };
        };

        // Ignore anything older than what we already know.
        if proposed.timestamp < latest.timestamp {
            return Decision::Reject(RejectReason::StaleTimestamp);
        }

        if latest.status.is_terminal() {
            // Manual recovery: a FAILED run may be marked RESOLVED.
            if latest.status == Status::Failed && proposed.status == Status::Resolved {
                return Decision::Persist;
            }
            return Decision::Reject(RejectReason::TerminalState);
        }

        if latest.status.is_draft() {
            return match proposed.status {
                Status::Draft => Decision::UpdateDraft,
                Status::Ready => Decision::Persist,
                _ => Decision::Reject(RejectReason::InvalidFromDraft),
            };
        }

        if latest.status.is_ready() {
            if proposed.status.is_draft() {
                return Decision::Reject(RejectReason::NoGoingBack);
            }
            if proposed.status.is_ready() {
                return Decision::Reject(RejectReason::DuplicateStatus);
            }
        }

        if latest.status.is_running() {
            if proposed.status.is_draft() || proposed.status.is_ready() {
                return Decision::Reject(RejectReason::NoGoingBack);
            }
            if proposed.status.is_running() {
                // Upstream engines emit chatty progress updates; keep one per window.
                return if proposed.timestamp - latest.timestamp >= RUNNING_HEARTBEAT_WINDOW {
                    Decision::Persist
                } else {
                    Decision::Reject(RejectReason::HeartbeatThrottled)
                };
            }
        }

        if self.contains_status(&proposed.status) {
            return Decision::Reject(RejectReason::DuplicateStatus);
        }

        Decision::Persist
    }
}

/// Parses an RFC3339 timestamp, requiring the UTC offset.
///
/// # Errors
/// Returns [`DomainError::Validation`] for unparseable values or non-UTC
/// offsets.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DomainError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DomainError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DomainError::Validation`] if formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DomainError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
