//! Static DAG and step definitions.
//!
//! These types describe a workflow as loaded from its definition: the steps,
//! their dependency edges, and the retry/repeat/continuation policies attached
//! to each step. They are immutable during a run; the execution core wraps
//! each [`Step`] in a runtime node that carries the mutable state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on in-memory output capture per step (1 MiB).
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Default grace period for shutdown cleanup in seconds.
pub const DEFAULT_MAX_CLEANUP_SECS: f64 = 60.0;

/// A complete workflow definition: steps plus DAG-level policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dag {
    /// Workflow name, unique per namespace
    pub name: String,

    /// Positional parameters passed to the run
    pub params: Vec<String>,

    /// DAG-level environment as KEY=VALUE entries
    pub env: Vec<String>,

    /// Secret KEY=VALUE entries; values are layered into scope and masked in
    /// every log and redirect stream
    pub secrets: Vec<String>,

    /// Base working directory for steps with relative `dir`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Directory for per-step stdout/stderr log files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// Default shell for steps that do not set one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// The steps of the workflow
    pub steps: Vec<Step>,

    /// Lifecycle handler steps
    pub handler_on: HandlerOn,

    /// DAG-level preconditions, evaluated before any step is dispatched
    pub preconditions: Vec<Condition>,

    /// Maximum number of concurrently running steps (0 = unlimited)
    pub max_active_steps: usize,

    /// Whole-run timeout in seconds (0 = none)
    pub timeout_secs: f64,

    /// Pause between step dispatches in seconds (rate limiting)
    pub delay_secs: f64,

    /// Grace period for in-flight steps during shutdown, in seconds
    pub max_cleanup_secs: f64,

    /// Cap on captured output per step in bytes
    pub max_output_size: usize,
}

impl Dag {
    /// Create an empty DAG with the given name and defaults applied.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_cleanup_secs: DEFAULT_MAX_CLEANUP_SECS,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            ..Default::default()
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Effective output cap, falling back to the default when unset.
    pub fn output_cap(&self) -> usize {
        if self.max_output_size == 0 {
            DEFAULT_MAX_OUTPUT_SIZE
        } else {
            self.max_output_size
        }
    }

    /// Whole-run timeout as a `Duration`, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs > 0.0 {
            Some(Duration::from_secs_f64(self.timeout_secs))
        } else {
            None
        }
    }

    /// Cleanup grace period, falling back to the default when unset.
    pub fn cleanup_timeout(&self) -> Duration {
        let secs = if self.max_cleanup_secs > 0.0 {
            self.max_cleanup_secs
        } else {
            DEFAULT_MAX_CLEANUP_SECS
        };
        Duration::from_secs_f64(secs)
    }
}

/// Lifecycle handler steps, dispatched by the scheduler after the main loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandlerOn {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel: Option<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<Step>,
}

/// One step of a workflow.
///
/// `name` is the unique key inside the DAG; `id`, when set, is a stable
/// identifier used to key output variables so renames do not break downstream
/// references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Step {
    /// Unique step name within the DAG
    pub name: String,

    /// Optional stable identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Command to execute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for `command`
    pub args: Vec<String>,

    /// Inline script, executed through the resolved shell instead of `command`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Working directory; relative paths are joined against the DAG directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Shell override for this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Extra arguments passed to the shell before `-c`
    pub shell_args: Vec<String>,

    /// Step environment as KEY=VALUE entries; evaluated in order, each entry
    /// visible to later ones
    pub env: Vec<String>,

    /// Names of steps this step depends on
    pub depends: Vec<String>,

    /// Variable name capturing trimmed stdout for downstream steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// File path receiving a copy of stdout, relative to the working directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// File path receiving a copy of stderr, relative to the working directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    /// Preconditions checked after dependencies pass; unmet means Skipped
    pub preconditions: Vec<Condition>,

    /// Continuation policy consulted by dependents when this step fails/skips
    pub continue_on: ContinueOn,

    /// Retry policy for failed attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Repeat policy for while/until loops
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_policy: Option<RepeatPolicy>,

    /// Per-step timeout in seconds (0 = none); exceeding it fails the step
    /// with exit code 124
    pub timeout_secs: f64,

    /// Signal name sent instead of SIGTERM when the scheduler stops this step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_on_stop: Option<String>,

    /// Executor selection and plugin-specific configuration
    pub executor: ExecutorConfig,

    /// Sub-workflow target when this step runs a child DAG
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<SubDagRef>,
}

impl Step {
    /// Create a step running `command` through the shell.
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Some(command.into()),
            ..Default::default()
        }
    }

    /// Declare a dependency on another step by name.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends.push(name.into());
        self
    }

    /// Capture trimmed stdout into the named output variable.
    pub fn with_output(mut self, variable: impl Into<String>) -> Self {
        self.output = Some(variable.into());
        self
    }

    /// The key under which this step's output variables are published:
    /// the stable `id` when present, else the name.
    pub fn output_key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    /// Per-step timeout as a `Duration`, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs > 0.0 {
            Some(Duration::from_secs_f64(self.timeout_secs))
        } else {
            None
        }
    }

    /// Whether this step loops via a repeat policy. Repetitive steps are
    /// exempt from shutdown signals and finish their in-flight iteration.
    pub fn is_repetitive(&self) -> bool {
        self.repeat_policy
            .as_ref()
            .map(|p| p.mode.is_some())
            .unwrap_or(false)
    }
}

/// Reference to a child workflow run by a sub-DAG step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubDagRef {
    /// Child DAG name
    pub name: String,
    /// Parameters forwarded to the child run
    pub params: String,
}

/// Executor selection for a step. An empty `kind` resolves to the default
/// shell-command executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorConfig {
    /// Executor type, e.g. "command", "subdag"
    #[serde(rename = "type")]
    pub kind: String,

    /// Plugin-specific configuration, passed through untouched
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// A precondition: either an expression compared against `expected`, or a
/// command whose exit status decides the outcome when `expected` is empty.
///
/// `expected` values with an `re:` prefix are matched as anchored regular
/// expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
    pub condition: String,
    pub expected: String,
}

impl Condition {
    pub fn new(condition: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            expected: expected.into(),
        }
    }
}

/// Continuation policy: converts a step's failure or skip into a
/// non-blocking signal for its dependents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContinueOn {
    /// Dependents may run even if this step failed
    pub failure: bool,

    /// Dependents may run even if this step was skipped
    pub skipped: bool,

    /// Record this step as Succeeded despite a failed execution
    pub mark_success: bool,

    /// Exit codes treated as continue-eligible even without `failure`
    pub exit_codes: Vec<i32>,
}

impl ContinueOn {
    /// Whether a failure with `exit_code` unblocks dependents.
    pub fn allows_failure(&self, exit_code: i32) -> bool {
        self.failure || self.exit_codes.contains(&exit_code)
    }

    /// Whether any continuation is configured at all. A failed step with no
    /// continuation blocks partial-success reporting.
    pub fn is_set(&self) -> bool {
        self.failure || self.skipped || self.mark_success || !self.exit_codes.is_empty()
    }
}

/// Retry policy for failed step attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum number of retries (total attempts = limit + 1)
    pub limit: u32,

    /// Base interval between retries in seconds
    pub interval_secs: f64,

    /// Backoff multiplier; 0 disables exponential growth
    pub backoff: f64,

    /// Cap on the computed interval in seconds; 0 = uncapped
    pub max_interval_secs: f64,

    /// Exit codes that trigger a retry; empty means any non-zero code
    pub exit_codes: Vec<i32>,
}

impl RetryPolicy {
    /// Whether an attempt that exited with `exit_code` should be retried.
    pub fn should_retry(&self, exit_code: i32) -> bool {
        if self.exit_codes.is_empty() {
            exit_code != 0
        } else {
            self.exit_codes.contains(&exit_code)
        }
    }

    /// Sleep before the k-th retry (1-based): `interval * backoff^(k-1)`,
    /// capped at `max_interval` when set; plain `interval` without backoff.
    pub fn backoff_interval(&self, retry_count: u32) -> Duration {
        compute_backoff(
            self.interval_secs,
            self.backoff,
            self.max_interval_secs,
            retry_count,
        )
    }
}

/// Repeat mode for looping steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// Repeat while the condition holds (or the step keeps succeeding)
    While,
    /// Repeat until the condition holds (or the step stops failing)
    Until,
}

/// Repeat policy: re-run a finished step while/until a condition is met.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepeatPolicy {
    /// Repeat mode; `None` disables repeating
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<RepeatMode>,

    /// Hard cap on total executions (0 = unbounded)
    pub limit: u32,

    /// Base interval between iterations in seconds
    pub interval_secs: f64,

    /// Backoff multiplier applied per iteration; 0 disables growth
    pub backoff: f64,

    /// Cap on the computed interval in seconds; 0 = uncapped
    pub max_interval_secs: f64,

    /// Condition consulted between iterations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    /// Exit codes consulted between iterations
    pub exit_codes: Vec<i32>,
}

impl RepeatPolicy {
    /// Sleep before the k-th repeat iteration (1-based), same arithmetic as
    /// retry backoff.
    pub fn backoff_interval(&self, done_count: u32) -> Duration {
        compute_backoff(
            self.interval_secs,
            self.backoff,
            self.max_interval_secs,
            done_count,
        )
    }
}

fn compute_backoff(interval: f64, backoff: f64, max_interval: f64, attempt: u32) -> Duration {
    if interval <= 0.0 {
        return Duration::ZERO;
    }
    let base = if backoff > 0.0 {
        interval * backoff.powi(attempt.saturating_sub(1) as i32)
    } else {
        interval
    };
    let capped = if max_interval > 0.0 {
        base.min(max_interval)
    } else {
        base
    };
    Duration::from_secs_f64(capped)
}
