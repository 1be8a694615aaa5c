#![forbid(unsafe_code)]

//! Wire-level run-state-change events.
//!
//! One generic shape serves the workflow, sequence and case run families;
//! [`RunKind`] only selects the outbound detail-type. Inbound payloads carry
//! a null `refId` placeholder that the reconciliation layer replaces with
//! the server-minted reference id on the way out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use runledger_domain::parse_rfc3339_utc;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EventError {
    #[error("failed to deserialize run state change: {0}")]
    Deserialization(String),
    #[error("invalid run state change: {0}")]
    Validation(String),
}

/// Which run family an event belongs to. The wire shape is identical across
/// families; the kind surfaces only in the outbound detail-type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Workflow,
    Sequence,
    Case,
}

impl RunKind {
    #[must_use]
    pub fn detail_type(self) -> &'static str {
        match self {
            Self::Workflow => "WorkflowRunStateChange",
            Self::Sequence => "SequenceRunStateChange",
            Self::Case => "CaseRunStateChange",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "workflow" => Some(Self::Workflow),
            "sequence" => Some(Self::Sequence),
            "case" => Some(Self::Case),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkedLibrary {
    pub orcabus_id: String,
    pub library_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Server-minted payload reference; always null on inbound events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    pub version: String,
    pub data: Value,
}

/// The canonical run-state-change notification body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStateChange {
    pub portal_run_id: String,
    /// RFC3339 UTC, caller-supplied; used for ordering, never defaulted.
    pub timestamp: String,
    pub status: String,
    pub workflow_name: String,
    pub workflow_version: String,
    pub workflow_run_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_libraries: Option<Vec<LinkedLibrary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EventPayload>,
}

impl RunStateChange {
    /// Unmarshalls a raw JSON event.
    ///
    /// # Errors
    /// Returns [`EventError::Deserialization`] when mandatory fields are
    /// absent or of the wrong shape (the serde message names the field),
    /// and [`EventError::Validation`] when present fields fail the
    /// content rules.
    pub fn from_json(raw: &Value) -> Result<Self, EventError> {
        let event: Self = serde_json::from_value(raw.clone())
            .map_err(|err| EventError::Deserialization(err.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Checks content rules on an already-deserialized event.
    ///
    /// # Errors
    /// Returns [`EventError::Validation`] on empty mandatory fields, a
    /// non-UTC or unparseable timestamp, or an inbound payload that
    /// already carries a `refId`.
    pub fn validate(&self) -> Result<(), EventError> {
        for (name, value) in [
            ("portalRunId", &self.portal_run_id),
            ("status", &self.status),
            ("workflowName", &self.workflow_name),
            ("workflowVersion", &self.workflow_version),
        ] {
            if value.trim().is_empty() {
                return Err(EventError::Validation(format!("{name} MUST be non-empty")));
            }
        }

        parse_rfc3339_utc(&self.timestamp)
            .map_err(|err| EventError::Validation(format!("timestamp: {err}")))?;

        if let Some(libraries) = &self.linked_libraries {
            for library in libraries {
                if library.orcabus_id.trim().is_empty() || library.library_id.trim().is_empty() {
                    return Err(EventError::Validation(
                        "linkedLibraries entries MUST carry orcabusId and libraryId".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Marshalls back to the wire JSON shape (camelCase keys, optional
    /// fields omitted when absent).
    ///
    /// # Errors
    /// Returns [`EventError::Validation`] if serialization fails.
    pub fn to_json(&self) -> Result<Value, EventError> {
        serde_json::to_value(self).map_err(|err| EventError::Validation(err.to_string()))
    }
}

/// An accepted state change mapped back to its outbound form. The bus
/// envelope (source, event-bus name) is the caller's concern; this is the
/// detail body plus its detail-type.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    pub detail_type: &'static str,
    pub detail: RunStateChange,
}

impl OutboundEnvelope {
    #[must_use]
    pub fn new(kind: RunKind, detail: RunStateChange) -> Self {
        Self {
            detail_type: kind.detail_type(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture_event() -> Value {
        json!({
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
            "payload": {
                "version": "0.1.0",
                "data": {"analysisId": "12345678-238c-4200-b632-d5dd8c8db94a"}
            }
        })
    }

    #[test]
    fn unmarshalls_a_complete_event() {
        let event = RunStateChange::from_json(&fixture_event());
        assert!(event.is_ok());
        let event = event.unwrap_or_else(|_| unreachable!());
        assert_eq!(event.portal_run_id, "2024111144ce2633");
        assert_eq!(event.workflow_run_name, "run1");
        let libraries = event.linked_libraries.unwrap_or_default();
        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].library_id, "L000001");
        let payload = event.payload;
        assert!(payload.is_some());
        let payload = payload.unwrap_or_else(|| unreachable!());
        assert!(payload.ref_id.is_none());
    }

    #[test]
    fn missing_mandatory_field_names_the_field() {
        let mut raw = fixture_event();
        let removed = raw
            .as_object_mut()
            .and_then(|object| object.remove("portalRunId"));
        assert!(removed.is_some());

        let result = RunStateChange::from_json(&raw);
        assert!(result.is_err());
        let message = match result {
            Err(err) => err.to_string(),
            Ok(_) => unreachable!(),
        };
        assert!(message.contains("portalRunId"));
    }

    #[test]
    fn wrong_shape_is_a_deserialization_error() {
        let mut raw = fixture_event();
        raw["linkedLibraries"] = json!("not-a-list");
        let result = RunStateChange::from_json(&raw);
        assert!(matches!(result, Err(EventError::Deserialization(_))));
    }

    #[test]
    fn empty_status_fails_validation() {
        let mut raw = fixture_event();
        raw["status"] = json!("  ");
        let result = RunStateChange::from_json(&raw);
        assert!(matches!(result, Err(EventError::Validation(_))));
    }

    #[test]
    fn non_utc_timestamp_fails_validation() {
        let mut raw = fixture_event();
        raw["timestamp"] = json!("2024-11-11T00:00:00+10:00");
        let result = RunStateChange::from_json(&raw);
        assert!(matches!(result, Err(EventError::Validation(_))));
    }

    #[test]
    fn optional_fields_may_be_absent() {
        let raw = json!({
            "portalRunId": "202405012397gatc",
            "timestamp": "2025-05-01T09:25:44Z",
            "status": "DRAFT",
            "workflowName": "ctTSO500",
            "workflowVersion": "4.2.7",
            "workflowRunName": "ctTSO500-L000002"
        });
        let event = RunStateChange::from_json(&raw);
        assert!(event.is_ok());
        let event = event.unwrap_or_else(|_| unreachable!());
        assert!(event.execution_id.is_none());
        assert!(event.linked_libraries.is_none());
        assert!(event.payload.is_none());
    }

    #[test]
    fn marshalling_round_trips_and_omits_absent_fields() {
        let event = RunStateChange::from_json(&fixture_event());
        assert!(event.is_ok());
        let event = event.unwrap_or_else(|_| unreachable!());

        let value = event.to_json();
        assert!(value.is_ok());
        let value = value.unwrap_or_else(|_| unreachable!());
        assert_eq!(value["portalRunId"], "2024111144ce2633");
        assert_eq!(value["linkedLibraries"][0]["orcabusId"], "lib.01J5M2J44HFJ9424G7074NKTGN");
        // refId is unset inbound and must not appear as an explicit null.
        let payload_keys = value["payload"]
            .as_object()
            .map(|object| object.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        assert!(!payload_keys.contains(&"refId".to_string()));

        let reparsed = RunStateChange::from_json(&value);
        assert!(reparsed.is_ok());
        assert_eq!(reparsed.unwrap_or_else(|_| unreachable!()), event);
    }

    #[test]
    fn outbound_envelope_carries_the_family_detail_type() {
        let event = RunStateChange::from_json(&fixture_event());
        assert!(event.is_ok());
        let event = event.unwrap_or_else(|_| unreachable!());

        let envelope = OutboundEnvelope::new(RunKind::Workflow, event.clone());
        assert_eq!(envelope.detail_type, "WorkflowRunStateChange");
        let envelope = OutboundEnvelope::new(RunKind::Sequence, event.clone());
        assert_eq!(envelope.detail_type, "SequenceRunStateChange");
        let envelope = OutboundEnvelope::new(RunKind::Case, event);
        assert_eq!(envelope.detail_type, "CaseRunStateChange");
    }

    #[test]
    fn run_kind_parse_matches_cli_tokens() {
        assert_eq!(RunKind::parse("workflow"), Some(RunKind::Workflow));
        assert_eq!(RunKind::parse("sequence"), Some(RunKind::Sequence));
        assert_eq!(RunKind::parse("case"), Some(RunKind::Case));
        assert_eq!(RunKind::parse("other"), None);
    }
}
