//! Persisted status snapshot model.
//!
//! [`DagRunStatus`] is the JSON snapshot the scheduler surfaces after every
//! progress event and at the end of a run. External sinks (attempt store,
//! HTTP API, coordinator) must preserve these fields bit-exactly, so every
//! field name here is part of the wire format.

use crate::definition::Step;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lifecycle status shared by runs and nodes.
///
/// Terminal states are `Succeeded`, `Failed`, `Aborted`, `Skipped` and
/// `PartiallySucceeded`; once a node reaches one of them it never changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Skipped,
    PartiallySucceeded,
}

impl RunStatus {
    /// Whether this status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::NotStarted | RunStatus::Running)
    }

    /// Whether this status counts as a successful outcome (process exit 0).
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::PartiallySucceeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::NotStarted => "not started",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Skipped => "skipped",
            RunStatus::PartiallySucceeded => "partially succeeded",
        };
        write!(f, "{}", s)
    }
}

/// Reference to a DAG run: name plus run ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagRunRef {
    pub name: String,
    pub id: String,
}

impl DagRunRef {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }
}

/// Summary of a child run spawned by a sub-DAG step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubRun {
    #[serde(rename = "dagRunID")]
    pub dag_run_id: String,
    pub params: String,
    pub status: RunStatus,
}

/// Snapshot of one node's state at emission time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    /// The full step definition, embedded so a snapshot is self-contained
    pub step: Step,

    pub status: RunStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub retry_count: u32,

    pub done_count: u32,

    pub repeated: bool,

    pub exit_code: i32,

    /// Path of the stdout log file
    pub stdout: String,

    /// Path of the stderr log file
    pub stderr: String,

    /// Captured output variables, keyed KEY → VALUE
    pub output_variables: HashMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Child runs spawned by this step (sub-DAG iterations)
    pub sub_runs: Vec<SubRun>,
}

/// Full status snapshot of one DAG-run attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagRunStatus {
    pub name: String,

    #[serde(rename = "dagRunID")]
    pub dag_run_id: String,

    #[serde(rename = "attemptID")]
    pub attempt_id: String,

    pub status: RunStatus,

    pub pid: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub params: String,

    /// Root run of the sub-DAG tree this attempt belongs to
    pub root: DagRunRef,

    /// Direct parent run, if this is a child run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<DagRunRef>,

    pub nodes: Vec<NodeSnapshot>,
}

impl DagRunStatus {
    /// Look up a node snapshot by step name.
    pub fn node(&self, step_name: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.step.name == step_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_success_classification() {
        assert!(!RunStatus::NotStarted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
        assert!(RunStatus::Succeeded.is_success());
        assert!(RunStatus::PartiallySucceeded.is_success());
        assert!(!RunStatus::Failed.is_success());
    }

    #[test]
    fn snapshot_field_names_are_wire_stable() {
        let status = DagRunStatus {
            name: "demo".to_string(),
            dag_run_id: "run-1".to_string(),
            attempt_id: "att-1".to_string(),
            status: RunStatus::Succeeded,
            pid: 42,
            root: DagRunRef::new("demo", "run-1"),
            nodes: vec![NodeSnapshot {
                step: Step::command("a", "true"),
                status: RunStatus::Succeeded,
                exit_code: 0,
                ..Default::default()
            }],
            ..Default::default()
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["dagRunID"], "run-1");
        assert_eq!(value["attemptID"], "att-1");
        assert_eq!(value["status"], "succeeded");
        assert_eq!(value["root"]["name"], "demo");
        let node = &value["nodes"][0];
        assert_eq!(node["retryCount"], 0);
        assert_eq!(node["doneCount"], 0);
        assert_eq!(node["exitCode"], 0);
        assert!(node["outputVariables"].is_object());
        assert!(node["subRuns"].is_array());
    }

    #[test]
    fn snapshot_round_trips() {
        let mut status = DagRunStatus::default();
        status.dag_run_id = "r".to_string();
        status.nodes.push(NodeSnapshot::default());
        let json = serde_json::to_string(&status).unwrap();
        let back: DagRunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dag_run_id, "r");
        assert_eq!(back.nodes.len(), 1);
    }
}
