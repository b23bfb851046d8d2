//! Runtime node: one step's state machine for one attempt.
//!
//! A [`Node`] wraps an immutable [`Step`] with the mutable [`NodeState`] the
//! scheduler and snapshots observe. All state transitions go through the
//! node's mutex. The lifecycle of one dispatch is
//! `prepare → execute (× retries/repeats) → teardown`; the scheduler owns the
//! retry/repeat loop and calls the bookkeeping methods here.
//!
//! Status transitions:
//!
//! ```text
//! NotStarted ──dispatch──▶ Running
//! Running ──exec ok──▶ Succeeded
//! Running ──exec err (markSuccess)──▶ Succeeded
//! Running ──exec err (retry available)──▶ Running   (after backoff)
//! Running ──exec err (no retry)──▶ Failed
//! Running ──step timeout──▶ Failed (exit 124)
//! Running ──cancel / run timeout──▶ Aborted
//! Running ──precondition unmet──▶ Skipped
//! NotStarted ──upstream failed──▶ Aborted
//! NotStarted ──upstream skipped──▶ Skipped
//! ```

use crate::context::RunContext;
use crate::error::{CoreError, Result};
use crate::eval::EvalOptions;
use crate::exec::{signal_by_name, ExecSpec, Executor};
use crate::output::{OutputCoordinator, OutputSetup};
use crate::scope::Scope;
use crate::conditions;
use chrono::{DateTime, Utc};
use dagrun_model::{NodeSnapshot, RunStatus, Step, StreamKind, SubRun};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(1);

/// Mutable per-attempt state of one node.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub status: RunStatus,
    pub retry_count: u32,
    pub done_count: u32,
    pub repeated: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retried_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub error: Option<String>,
    pub stdout_log: String,
    pub stderr_log: String,
    /// This node's own captured output variables
    pub output_variables: HashMap<String, String>,
    pub sub_runs: Vec<SubRun>,
}

struct Prepared {
    working_dir: PathBuf,
    shell: String,
    shell_args: Vec<String>,
    stdout_log: PathBuf,
}

enum RunOutcome {
    Finished(Result<i32>),
    TimedOut,
    Canceled,
}

/// Runtime wrapper around one step.
pub struct Node {
    step: Step,
    id: usize,
    state: Mutex<NodeState>,
    prepared: Mutex<Option<Prepared>>,
    coordinator: Mutex<Option<OutputCoordinator>>,
    executor: Mutex<Option<Arc<dyn Executor>>>,
}

impl Node {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(NodeState::default()),
            prepared: Mutex::new(None),
            coordinator: Mutex::new(None),
            executor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.step.name
    }

    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: RunStatus) {
        self.state.lock().status = status;
    }

    /// Atomically claim the node for dispatch: NotStarted → Running.
    /// Returns false when another parent's completion already claimed it or a
    /// cascade marked it terminally.
    pub fn claim_for_dispatch(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == RunStatus::NotStarted {
            state.status = RunStatus::Running;
            true
        } else {
            false
        }
    }

    /// Mark a never-dispatched node terminally (upstream failed/skipped,
    /// cancellation cascade).
    pub fn mark_not_run(&self, status: RunStatus, error: Option<&CoreError>) {
        let mut state = self.state.lock();
        state.status = status;
        if let Some(error) = error {
            state.error = Some(error.to_string());
        }
    }

    /// Record a hard failure (setup error, unevaluable condition).
    pub fn mark_failed(&self, error: &CoreError) {
        let mut state = self.state.lock();
        state.status = RunStatus::Failed;
        state.error = Some(error.to_string());
    }

    /// The working directory resolved by [`Self::prepare`].
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.prepared.lock().as_ref().map(|p| p.working_dir.clone())
    }

    pub fn state_snapshot(&self) -> NodeState {
        self.state.lock().clone()
    }

    pub fn output_variables(&self) -> HashMap<String, String> {
        self.state.lock().output_variables.clone()
    }

    pub fn exit_code(&self) -> i32 {
        self.state.lock().exit_code
    }

    pub fn is_repetitive(&self) -> bool {
        self.step.is_repetitive()
    }

    /// Resolve the working directory, assign log paths, open the output
    /// coordinator, and record the start time.
    pub async fn prepare(&self, ctx: &RunContext, scope: &Scope) -> Result<()> {
        let working_dir = ctx.resolve_working_dir(&self.step, scope).await?;
        let (stdout_log, stderr_log) = ctx.log_paths(&self.step.name);
        let (shell, shell_args) = ctx.resolve_shell(&self.step);
        let opts = ctx.eval_options(&self.step, Some(&working_dir));

        let stdout_redirect = match &self.step.stdout {
            Some(path) => Some(resolve_redirect(scope, &opts, path, &working_dir).await?),
            None => None,
        };
        let stderr_redirect = match &self.step.stderr {
            Some(path) => Some(resolve_redirect(scope, &opts, path, &working_dir).await?),
            None => None,
        };

        let coordinator = OutputCoordinator::open(OutputSetup {
            stdout_log: stdout_log.clone(),
            stderr_log: stderr_log.clone(),
            stdout_redirect,
            stderr_redirect,
            capture_output: self.step.output.is_some(),
            max_output_size: ctx.dag.output_cap(),
            secrets: scope.secret_values(),
        })
        .await?;

        *self.coordinator.lock() = Some(coordinator);
        *self.prepared.lock() = Some(Prepared {
            working_dir,
            shell,
            shell_args,
            stdout_log: stdout_log.clone(),
        });

        let mut state = self.state.lock();
        state.stdout_log = stdout_log.to_string_lossy().into_owned();
        state.stderr_log = stderr_log.to_string_lossy().into_owned();
        state.started_at = Some(Utc::now());
        Ok(())
    }

    /// Run one attempt of the step's executor, enforcing the per-step
    /// timeout before the ambient cancellation.
    ///
    /// Returns `Ok(())` on exit code 0; otherwise records the failure on the
    /// node and returns the corresponding error. Repetitive nodes ignore the
    /// cancel signal and finish their iteration.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        scope: &Scope,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let (working_dir, shell, shell_args, stdout_log) = {
            let prepared = self.prepared.lock();
            let p = prepared
                .as_ref()
                .ok_or_else(|| CoreError::Validation(format!("node '{}' not prepared", self.step.name)))?;
            (
                p.working_dir.clone(),
                p.shell.clone(),
                p.shell_args.clone(),
                p.stdout_log.clone(),
            )
        };
        let coordinator = self
            .coordinator
            .lock()
            .clone()
            .ok_or_else(|| CoreError::Validation(format!("node '{}' has no output pipeline", self.step.name)))?;

        let opts = EvalOptions {
            shell: shell.clone(),
            shell_args: shell_args.clone(),
            working_dir: Some(working_dir.clone()),
        };

        // evaluate the command line against the step's scope
        let mut step = self.step.clone();
        if let Some(command) = &step.command {
            step.command = Some(scope.eval(&opts, command).await?);
        }
        let mut args = Vec::with_capacity(step.args.len());
        for arg in &step.args {
            args.push(scope.eval(&opts, arg).await?);
        }
        step.args = args;

        let mut env = scope.to_env_map();
        for (key, value) in ctx.child_env(&step.name, &stdout_log, &working_dir) {
            env.insert(key, value);
        }

        let spec = ExecSpec {
            step,
            working_dir,
            shell,
            shell_args,
            env,
            script_dir: ctx.log_dir.clone(),
            stdout: coordinator.sink(StreamKind::Stdout),
            stderr: coordinator.sink(StreamKind::Stderr),
        };
        let executor = ctx.registry.create(spec)?;
        *self.executor.lock() = Some(executor.clone());

        let outcome = self.wait_for_executor(executor.clone(), cancel).await;
        *self.executor.lock() = None;

        let result = match outcome {
            RunOutcome::Finished(Ok(code)) => {
                self.state.lock().exit_code = code;
                self.collect_output(&coordinator).await;
                if code == 0 {
                    Ok(())
                } else {
                    let error = CoreError::ExecutorFailure { exit_code: code };
                    self.state.lock().error = Some(error.to_string());
                    Err(error)
                }
            }
            RunOutcome::Finished(Err(error)) => {
                let mut state = self.state.lock();
                state.exit_code = -1;
                state.error = Some(error.to_string());
                drop(state);
                Err(error)
            }
            RunOutcome::TimedOut => {
                self.collect_output(&coordinator).await;
                let error = CoreError::StepTimeout;
                let mut state = self.state.lock();
                state.exit_code = 124;
                state.error = Some(error.to_string());
                drop(state);
                Err(error)
            }
            RunOutcome::Canceled => {
                let mut state = self.state.lock();
                state.status = RunStatus::Aborted;
                state.error = Some(CoreError::Canceled.to_string());
                drop(state);
                Err(CoreError::Canceled)
            }
        };
        result
    }

    async fn wait_for_executor(
        &self,
        executor: Arc<dyn Executor>,
        mut cancel: watch::Receiver<bool>,
    ) -> RunOutcome {
        let runner = executor.clone();
        let mut run = tokio::spawn(async move { runner.run().await });
        let timeout = self.step.timeout();
        let repetitive = self.is_repetitive();

        let timeout_fut = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => futures::future::pending().await,
            }
        };
        // repetitive nodes are exempt: they finish the in-flight iteration
        let cancel_fut = async {
            if repetitive {
                futures::future::pending::<()>().await;
            }
            loop {
                if *cancel.borrow() {
                    return;
                }
                if cancel.changed().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            // fixed polling order: a finished process wins outright, and the
            // step's own timeout is enforced before the ambient cancellation
            biased;
            joined = &mut run => match joined {
                Ok(result) => RunOutcome::Finished(result),
                Err(e) => RunOutcome::Finished(Err(CoreError::Io(std::io::Error::other(e)))),
            },
            _ = timeout_fut => {
                executor.kill().await;
                let _ = tokio::time::timeout(Duration::from_secs(5), &mut run).await;
                RunOutcome::TimedOut
            }
            _ = cancel_fut => {
                executor.kill().await;
                let _ = tokio::time::timeout(Duration::from_secs(5), &mut run).await;
                RunOutcome::Canceled
            }
        }
    }

    /// Fold the attempt's captured stdout into the node's output variables.
    /// A size-exceeded capture keeps the partial data and is not fatal.
    async fn collect_output(&self, coordinator: &OutputCoordinator) {
        let Some(variable) = &self.step.output else {
            return;
        };
        if let Err(CoreError::OutputSizeExceeded { limit }) = coordinator.finish_capture().await {
            tracing::warn!(
                step = %self.step.name,
                limit,
                "captured output truncated at the size limit"
            );
        }
        if let Some(value) = coordinator.captured().await {
            self.state
                .lock()
                .output_variables
                .insert(variable.clone(), value);
        }
    }

    /// Backoff before the next retry, when the error and policy allow one.
    pub fn retry_backoff(&self, error: &CoreError) -> Option<Duration> {
        if error.is_cancellation() {
            return None;
        }
        let policy = self.step.retry_policy.as_ref()?;
        let state = self.state.lock();
        if state.status == RunStatus::Aborted || state.retry_count >= policy.limit {
            return None;
        }
        let exit_code = error.exit_code().unwrap_or(state.exit_code);
        if !policy.should_retry(exit_code) {
            return None;
        }
        Some(policy.backoff_interval(state.retry_count + 1))
    }

    pub fn mark_retry(&self) {
        let mut state = self.state.lock();
        state.retry_count += 1;
        state.retried_at = Some(Utc::now());
    }

    /// Backoff before the next repeat iteration, when the policy asks for
    /// one. The scope must already contain this node's own output variables
    /// so conditions can reference them.
    pub async fn repeat_backoff(
        &self,
        scope: &Scope,
        opts: &EvalOptions,
    ) -> Result<Option<Duration>> {
        let Some(policy) = &self.step.repeat_policy else {
            return Ok(None);
        };
        let Some(mode) = policy.mode else {
            return Ok(None);
        };
        let (done_count, exit_code) = {
            let state = self.state.lock();
            (state.done_count, state.exit_code)
        };
        if policy.limit > 0 && done_count >= policy.limit {
            return Ok(None);
        }

        use dagrun_model::RepeatMode;
        let repeat = if let Some(condition) = &policy.condition {
            let matched = conditions::evaluate(condition, scope, opts).await?;
            match mode {
                RepeatMode::While => matched,
                RepeatMode::Until => !matched,
            }
        } else if !policy.exit_codes.is_empty() {
            let listed = policy.exit_codes.contains(&exit_code);
            match mode {
                RepeatMode::While => listed,
                RepeatMode::Until => !listed,
            }
        } else {
            match mode {
                RepeatMode::While => exit_code == 0,
                RepeatMode::Until => exit_code != 0,
            }
        };
        Ok(repeat.then(|| policy.backoff_interval(done_count)))
    }

    /// Count a completed attempt. Aborted attempts do not count.
    pub fn increment_done(&self) {
        self.state.lock().done_count += 1;
    }

    pub fn set_repeated(&self) {
        self.state.lock().repeated = true;
    }

    /// Re-arm the node for a retry: capture pipe re-armed (captured text of
    /// prior attempts is kept and concatenated), status back to Running,
    /// stale error cleared.
    pub async fn prepare_retry_attempt(&self) {
        let coordinator = self.coordinator.lock().clone();
        if let Some(coordinator) = coordinator {
            coordinator.rearm_capture().await;
        }
        self.reopen_running();
    }

    /// Re-arm the node for a repeat iteration: the capture starts clean so
    /// repeat conditions observe the iteration's own output.
    pub async fn prepare_repeat_attempt(&self) {
        let coordinator = self.coordinator.lock().clone();
        if let Some(coordinator) = coordinator {
            coordinator.reset_capture().await;
        }
        self.reopen_running();
    }

    fn reopen_running(&self) {
        let mut state = self.state.lock();
        state.status = RunStatus::Running;
        state.error = None;
    }

    /// Apply a final (non-retried) execution error to the node status.
    pub fn apply_execution_error(&self, error: &CoreError) {
        let mut state = self.state.lock();
        if error.is_cancellation() || state.status == RunStatus::Aborted {
            state.status = RunStatus::Aborted;
            return;
        }
        if self.step.continue_on.mark_success {
            state.status = RunStatus::Succeeded;
            return;
        }
        state.status = RunStatus::Failed;
    }

    /// Close out a node still marked Running after its last attempt.
    pub fn finalize(&self, canceled: bool) {
        let mut state = self.state.lock();
        if state.status == RunStatus::Running {
            state.status = if canceled {
                RunStatus::Aborted
            } else {
                RunStatus::Succeeded
            };
        }
    }

    /// Flush and close the output pipeline; record the finish time.
    pub async fn teardown(&self) -> Result<()> {
        let coordinator = self.coordinator.lock().clone();
        let result = match coordinator {
            Some(coordinator) => match coordinator.close().await {
                Ok(()) | Err(CoreError::OutputSizeExceeded { .. }) => Ok(()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        };
        self.state.lock().finished_at = Some(Utc::now());
        result
    }

    /// Forward a stop signal to the running executor. When `allow_override`
    /// is set and the step configures `signal_on_stop`, that signal is sent
    /// instead.
    pub async fn signal(&self, signal: i32, allow_override: bool) {
        let signal = if allow_override {
            self.step
                .signal_on_stop
                .as_deref()
                .and_then(signal_by_name)
                .unwrap_or(signal)
        } else {
            signal
        };
        let executor = self.executor.lock().clone();
        if let Some(executor) = executor {
            tracing::debug!(step = %self.step.name, signal, "forwarding signal");
            executor.signal(signal).await;
        }
    }

    /// Immediate termination: SIGKILL the executor and mark the node
    /// Aborted.
    pub async fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if !state.status.is_terminal() {
                state.status = RunStatus::Aborted;
            }
        }
        let executor = self.executor.lock().clone();
        if let Some(executor) = executor {
            executor.kill().await;
        }
    }

    /// Clear all runtime state, reopening the node for a fresh run.
    pub fn reset_state(&self) {
        *self.state.lock() = NodeState::default();
    }

    /// Snapshot for persistence and progress events.
    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock();
        NodeSnapshot {
            step: self.step.clone(),
            status: state.status,
            started_at: state.started_at,
            finished_at: state.finished_at,
            retry_count: state.retry_count,
            done_count: state.done_count,
            repeated: state.repeated,
            exit_code: state.exit_code,
            stdout: state.stdout_log.clone(),
            stderr: state.stderr_log.clone(),
            output_variables: state.output_variables.clone(),
            error: state.error.clone(),
            sub_runs: state.sub_runs.clone(),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("step", &self.step.name)
            .field("status", &self.status())
            .finish()
    }
}

async fn resolve_redirect(
    scope: &Scope,
    opts: &EvalOptions,
    path: &str,
    working_dir: &std::path::Path,
) -> Result<PathBuf> {
    let expanded = scope.eval(opts, path).await?;
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(working_dir.join(path))
    }
}
