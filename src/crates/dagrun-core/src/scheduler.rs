//! The runner: dependency-ordered scheduling of an execution graph.
//!
//! One task runs the event loop over two channels sized to the node count
//! (so dispatches never block): `ready` carries nodes whose dependencies all
//! passed, `done` carries completions. Each dispatched node runs its own
//! task through the prepare → execute (× retry/repeat) → teardown pipeline
//! and reports back on `done`; completions cascade readiness to dependents.
//!
//! Cancellation semantics worth calling out:
//!
//! - the cancel flag is set *before* signals are forwarded to nodes, so a
//!   task whose executor exits normally right after a cancel still marks
//!   itself Aborted rather than Succeeded;
//! - repetitive steps (repeat mode set) are never signaled; they finish the
//!   in-flight iteration and stop at the repeat check;
//! - the DAG-level timeout aborts the run (`last_error = Canceled`), while a
//!   per-step timeout merely fails the step with exit code 124.

use crate::conditions;
use crate::context::RunContext;
use crate::error::{CoreError, Result};
use crate::eval::EvalOptions;
use crate::graph::ExecutionGraph;
use crate::node::Node;
use crate::scope::{Scope, VarSource};
use dagrun_model::{DagRunStatus, NodeSnapshot, RunStatus, StatusWriter, Step};
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Environment key exposing the final run status to handler steps.
pub const ENV_KEY_RUN_STATUS: &str = "DAG_RUN_STATUS";

/// Counters maintained by the event loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub dispatched: u64,
    pub completed: u64,
}

#[derive(Default)]
struct RunnerState {
    canceled: bool,
    last_error: Option<Arc<CoreError>>,
}

enum Readiness {
    Ready,
    Blocked,
    Disqualified,
}

/// Tracks what has been placed on the ready channel. Only touched from the
/// event-loop task, so plain fields suffice.
struct DispatchState {
    ready_tx: mpsc::Sender<usize>,
    pending: usize,
    queued: HashSet<usize>,
}

impl DispatchState {
    fn enqueue(&mut self, id: usize) {
        if self.queued.insert(id) {
            self.pending += 1;
            // channel is sized to the node count and each node is queued at
            // most once, so this cannot fill up
            let _ = self.ready_tx.try_send(id);
        }
    }
}

struct RunnerInner {
    ctx: RunContext,
    state: RwLock<RunnerState>,
    metrics: RwLock<Metrics>,
    cancel_tx: watch::Sender<bool>,
    progress_tx: RwLock<Option<mpsc::Sender<NodeSnapshot>>>,
    status_writer: RwLock<Option<Arc<dyn StatusWriter>>>,
    base_scope: RwLock<Scope>,
    handler_nodes: RwLock<Vec<Arc<Node>>>,
}

/// Schedules one execution graph. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(ctx: RunContext) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(RunnerInner {
                ctx,
                state: RwLock::new(RunnerState::default()),
                metrics: RwLock::new(Metrics::default()),
                cancel_tx,
                progress_tx: RwLock::new(None),
                status_writer: RwLock::new(None),
                base_scope: RwLock::new(Scope::new()),
                handler_nodes: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Replicate node snapshots to an external progress channel.
    pub fn with_progress(self, tx: mpsc::Sender<NodeSnapshot>) -> Self {
        *self.inner.progress_tx.write() = Some(tx);
        self
    }

    /// Convenience wrapper around [`Self::with_progress`]: installs a fresh
    /// progress channel and returns its receiving stream.
    pub fn progress_stream(
        &self,
        capacity: usize,
    ) -> tokio_stream::wrappers::ReceiverStream<NodeSnapshot> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.inner.progress_tx.write() = Some(tx);
        tokio_stream::wrappers::ReceiverStream::new(rx)
    }

    /// Surface a full status snapshot to `writer` after each progress event.
    pub fn with_status_writer(self, writer: Arc<dyn StatusWriter>) -> Self {
        *self.inner.status_writer.write() = Some(writer);
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.inner.ctx
    }

    pub fn metrics(&self) -> Metrics {
        *self.inner.metrics.read()
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.state.read().canceled
    }

    /// The error that decided a Failed outcome, if any.
    pub fn last_error(&self) -> Option<Arc<CoreError>> {
        self.inner.state.read().last_error.clone()
    }

    /// Handler nodes executed after the main loop, in dispatch order.
    pub fn handler_results(&self) -> Vec<NodeSnapshot> {
        self.inner
            .handler_nodes
            .read()
            .iter()
            .map(|n| n.snapshot())
            .collect()
    }

    fn set_canceled(&self) {
        self.inner.state.write().canceled = true;
        let _ = self.inner.cancel_tx.send(true);
    }

    fn set_last_error(&self, error: CoreError) {
        self.inner.state.write().last_error = Some(Arc::new(error));
    }

    /// Run the graph to completion and return the final status.
    pub async fn run(&self, plan: &Arc<ExecutionGraph>) -> Result<RunStatus> {
        let dag = self.inner.ctx.dag.clone();
        info!(
            dag = %dag.name,
            run_id = %self.inner.ctx.dag_run_id,
            steps = plan.len(),
            "starting dag run"
        );

        let base_scope = self.build_base_scope().await?;
        *self.inner.base_scope.write() = base_scope.clone();

        // DAG-level preconditions gate the whole run
        if !dag.preconditions.is_empty() {
            let opts = self.dag_eval_options();
            if let Err(e) = conditions::meets_all(&dag.preconditions, &base_scope, &opts).await {
                warn!(error = %e, "dag preconditions not met, aborting run");
                for node in plan.nodes() {
                    node.mark_not_run(RunStatus::Aborted, Some(&e));
                }
                self.set_canceled();
                self.set_last_error(e);
                plan.finish();
                self.dispatch_handlers(plan).await;
                self.write_status(plan).await;
                return Ok(self.status(plan));
            }
        }

        self.event_loop(plan).await;

        plan.finish();
        let final_status = self.status(plan);
        self.dispatch_handlers(plan).await;
        self.write_status(plan).await;
        info!(dag = %dag.name, status = %final_status, "dag run finished");
        Ok(final_status)
    }

    async fn event_loop(&self, plan: &Arc<ExecutionGraph>) {
        let dag = self.inner.ctx.dag.clone();
        let capacity = plan.len().max(1);
        let (ready_tx, mut ready_rx) = mpsc::channel::<usize>(capacity);
        let (done_tx, mut done_rx) = mpsc::channel::<usize>(capacity);
        let mut dispatch = DispatchState {
            ready_tx,
            pending: 0,
            queued: HashSet::new(),
        };

        // seed with every node whose dependencies already pass (no deps on a
        // fresh graph; finished parents on a retry graph)
        let roots: Vec<usize> = plan
            .nodes()
            .iter()
            .filter(|n| n.status() == RunStatus::NotStarted)
            .map(|n| n.id())
            .collect();
        let marked = self.propagate_readiness(plan, roots, &mut dispatch);
        for node in marked {
            self.emit_progress(&node).await;
        }

        let mut running = 0usize;
        let mut deadline = dag
            .timeout()
            .map(|t| tokio::time::Instant::now() + t);
        let delay = (dag.delay_secs > 0.0).then(|| Duration::from_secs_f64(dag.delay_secs));
        let mut cancel_rx = self.inner.cancel_tx.subscribe();

        loop {
            if running == 0 && (plan.check_finished() || self.is_canceled()) {
                break;
            }
            if running == 0 && dispatch.pending == 0 && !self.is_canceled() {
                // no work in flight, nothing queued, graph unfinished: a bug,
                // but one that must be reported rather than hanging
                error!(dag = %dag.name, "deadlock detected, aborting run");
                self.set_last_error(CoreError::DeadlockDetected);
                break;
            }

            let at_cap = dag.max_active_steps > 0 && running >= dag.max_active_steps;
            let timeout_armed = deadline.is_some();

            tokio::select! {
                Some(id) = ready_rx.recv(), if !at_cap && !self.is_canceled() => {
                    dispatch.pending -= 1;
                    let Some(node) = plan.node_by_id(id) else { continue };
                    // re-check under the node lock and claim Running now, so
                    // concurrent parent completions cannot double-dispatch
                    if !node.claim_for_dispatch() {
                        continue;
                    }
                    running += 1;
                    self.inner.metrics.write().dispatched += 1;
                    debug!(step = %node.name(), running, "dispatching step");
                    self.emit_progress(node).await;
                    self.spawn_node_task(plan, node, &done_tx);
                    if let Some(pause) = delay {
                        tokio::time::sleep(pause).await;
                    }
                }
                Some(id) = done_rx.recv() => {
                    running -= 1;
                    self.inner.metrics.write().completed += 1;
                    if let Some(node) = plan.node_by_id(id) {
                        debug!(step = %node.name(), status = %node.status(), "step completed");
                        self.emit_progress(node).await;
                        let children: Vec<usize> = plan.dependents(id).to_vec();
                        let marked = self.propagate_readiness(plan, children, &mut dispatch);
                        for node in marked {
                            self.emit_progress(&node).await;
                        }
                    }
                    self.write_status(plan).await;
                }
                _ = cancel_rx.changed() => {
                    // flag already set; the next iteration stops dispatching
                }
                _ = sleep_until_deadline(deadline), if timeout_armed => {
                    deadline = None;
                    warn!(dag = %dag.name, "run timeout reached, aborting");
                    self.set_last_error(CoreError::Canceled);
                    self.abort_run(plan, libc::SIGTERM).await;
                }
            }
        }
    }

    fn spawn_node_task(
        &self,
        plan: &Arc<ExecutionGraph>,
        node: &Arc<Node>,
        done_tx: &mpsc::Sender<usize>,
    ) {
        let runner = self.clone();
        let plan = plan.clone();
        let node = node.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            runner.run_node_pipeline(&plan, &node).await;
            let _ = done_tx.send(node.id()).await;
        });
    }

    /// Per-task pipeline: scope setup, preconditions, the attempt loop with
    /// retries and repeats, then teardown. All failures are folded into the
    /// node's state; this never unwinds the scheduler.
    async fn run_node_pipeline(&self, plan: &Arc<ExecutionGraph>, node: &Arc<Node>) {
        let ctx = &self.inner.ctx;

        let scope = match self.node_scope(plan, node).await {
            Ok(scope) => scope,
            Err(e) => {
                error!(step = %node.name(), error = %e, "failed to set up step environment");
                node.mark_failed(&e);
                self.set_last_error(e);
                return;
            }
        };

        if let Err(e) = node.prepare(ctx, &scope).await {
            error!(step = %node.name(), error = %e, "failed to prepare step");
            node.mark_failed(&e);
            self.set_last_error(e);
            return;
        }

        let opts = ctx.eval_options(node.step(), node.working_dir().as_deref());

        if !node.step().preconditions.is_empty() {
            match conditions::meets_all(&node.step().preconditions, &scope, &opts).await {
                Ok(()) => {}
                Err(e @ CoreError::PreconditionNotMet(_)) => {
                    info!(step = %node.name(), reason = %e, "precondition not met, skipping");
                    node.mark_not_run(RunStatus::Skipped, Some(&e));
                    let _ = node.teardown().await;
                    return;
                }
                Err(e) => {
                    error!(step = %node.name(), error = %e, "precondition evaluation failed");
                    node.mark_failed(&e);
                    self.set_last_error(e);
                    let _ = node.teardown().await;
                    return;
                }
            }
        }

        let cancel_rx = self.inner.cancel_tx.subscribe();
        loop {
            match node.execute(ctx, &scope, cancel_rx.clone()).await {
                Ok(()) => {}
                Err(error) => {
                    if !self.is_canceled() {
                        if let Some(backoff) = node.retry_backoff(&error) {
                            node.mark_retry();
                            warn!(
                                step = %node.name(),
                                retry = node.state_snapshot().retry_count,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %error,
                                "step failed, retrying after backoff"
                            );
                            self.emit_progress(node).await;
                            tokio::time::sleep(backoff).await;
                            node.prepare_retry_attempt().await;
                            continue;
                        }
                    }
                    node.apply_execution_error(&error);
                    if node.status() == RunStatus::Failed {
                        self.set_last_error(error);
                    }
                }
            }

            if node.status() != RunStatus::Aborted {
                node.increment_done();
            }

            if !self.is_canceled() {
                // the node's own outputs are visible to the repeat condition
                let repeat_scope =
                    scope.with_step_outputs(node.output_variables(), node.step().output_key());
                match node.repeat_backoff(&repeat_scope, &opts).await {
                    Ok(Some(backoff)) => {
                        node.set_repeated();
                        debug!(
                            step = %node.name(),
                            done = node.state_snapshot().done_count,
                            backoff_ms = backoff.as_millis() as u64,
                            "repeating step"
                        );
                        tokio::time::sleep(backoff).await;
                        if self.is_canceled() {
                            break;
                        }
                        node.prepare_repeat_attempt().await;
                        self.emit_progress(node).await;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(step = %node.name(), error = %e, "repeat condition evaluation failed");
                        node.mark_failed(&e);
                        self.set_last_error(e);
                    }
                }
            }
            break;
        }

        node.finalize(self.is_canceled());
        if let Err(e) = node.teardown().await {
            warn!(step = %node.name(), error = %e, "teardown failed");
        }
    }

    /// BFS readiness propagation from `roots`. The readiness check both
    /// answers whether a node is runnable and, when a dependency's terminal
    /// state disqualifies it, marks the node terminally; such nodes are
    /// returned so progress can be emitted, and their own dependents are
    /// visited in turn so cascading skips reach all descendants.
    fn propagate_readiness(
        &self,
        plan: &ExecutionGraph,
        roots: Vec<usize>,
        dispatch: &mut DispatchState,
    ) -> Vec<Arc<Node>> {
        let mut marked = Vec::new();
        let mut queue: VecDeque<usize> = roots.into();
        while let Some(id) = queue.pop_front() {
            let Some(node) = plan.node_by_id(id) else { continue };
            if node.status() != RunStatus::NotStarted {
                continue;
            }
            match self.check_dependencies(plan, node) {
                Readiness::Ready => {
                    if !self.is_canceled() {
                        dispatch.enqueue(id);
                    }
                }
                Readiness::Blocked => {}
                Readiness::Disqualified => {
                    marked.push(node.clone());
                    queue.extend(plan.dependents(id));
                }
            }
        }
        marked
    }

    /// One node's readiness against all of its dependencies. The first
    /// disqualifying dependency fixes the node's terminal state.
    fn check_dependencies(&self, plan: &ExecutionGraph, node: &Arc<Node>) -> Readiness {
        for &dep_id in plan.dependencies(node.id()) {
            let Some(dep) = plan.node_by_id(dep_id) else {
                continue;
            };
            match dep.status() {
                RunStatus::Succeeded | RunStatus::PartiallySucceeded => {}
                RunStatus::Failed => {
                    if !dep.step().continue_on.allows_failure(dep.exit_code()) {
                        node.mark_not_run(
                            RunStatus::Aborted,
                            Some(&CoreError::UpstreamFailed {
                                step: dep.name().to_string(),
                            }),
                        );
                        return Readiness::Disqualified;
                    }
                }
                RunStatus::Skipped => {
                    if !dep.step().continue_on.skipped {
                        node.mark_not_run(
                            RunStatus::Skipped,
                            Some(&CoreError::UpstreamSkipped {
                                step: dep.name().to_string(),
                            }),
                        );
                        return Readiness::Disqualified;
                    }
                }
                RunStatus::Aborted => {
                    node.mark_not_run(RunStatus::Aborted, None);
                    return Readiness::Disqualified;
                }
                RunStatus::NotStarted | RunStatus::Running => return Readiness::Blocked,
            }
        }
        Readiness::Ready
    }

    /// Base scope shared by every step: OS env, secrets, then DAG env
    /// entries evaluated in order (each entry sees its predecessors).
    async fn build_base_scope(&self) -> Result<Scope> {
        let dag = &self.inner.ctx.dag;
        let mut scope = Scope::with_os_env();

        for entry in &dag.secrets {
            if let Some((key, value)) = split_env_entry(entry) {
                scope = scope.with_entry(key, value, VarSource::Secret);
            }
        }

        let opts = self.dag_eval_options();
        for entry in &dag.env {
            let Some((key, value)) = split_env_entry(entry) else {
                warn!(entry = %entry, "ignoring malformed env entry");
                continue;
            };
            let value = scope.eval(&opts, &value).await?;
            scope = scope.with_entry(key, value, VarSource::DagEnv);
        }
        Ok(scope)
    }

    /// Scope for one node: base scope, output variables of every reachable
    /// predecessor, then the step's own env entries evaluated in order.
    async fn node_scope(&self, plan: &ExecutionGraph, node: &Arc<Node>) -> Result<Scope> {
        let mut scope = self.inner.base_scope.read().clone();

        for ancestor_id in plan.ancestors(node.id()) {
            let Some(dep) = plan.node_by_id(ancestor_id) else {
                continue;
            };
            let outputs = dep.output_variables();
            if !outputs.is_empty() {
                scope = scope.with_step_outputs(outputs, dep.step().output_key());
            }
        }

        let opts = self.inner.ctx.eval_options(node.step(), None);
        for entry in &node.step().env {
            let Some((key, value)) = split_env_entry(entry) else {
                warn!(step = %node.name(), entry = %entry, "ignoring malformed env entry");
                continue;
            };
            let value = scope.eval(&opts, &value).await?;
            scope = scope.with_entry(key, value, VarSource::StepEnv);
        }
        Ok(scope)
    }

    fn dag_eval_options(&self) -> EvalOptions {
        let dag = &self.inner.ctx.dag;
        let mut opts = EvalOptions::default();
        if let Some(shell) = dag.shell.clone().filter(|s| !s.is_empty()) {
            opts.shell = shell;
        }
        if let Some(dir) = dag.working_dir.clone().filter(|s| !s.is_empty()) {
            opts.working_dir = Some(dir.into());
        }
        opts
    }

    /// Cancel the run: set the flag, then hard-kill every non-repetitive
    /// node.
    pub async fn cancel(&self, plan: &ExecutionGraph) {
        info!(dag = %self.inner.ctx.dag.name, "canceling dag run");
        self.set_canceled();
        for node in plan.nodes() {
            if !node.is_repetitive() {
                node.cancel().await;
            }
        }
    }

    /// Forward a termination signal to running nodes. The cancel flag is set
    /// *before* forwarding so a normally-exiting task cannot record itself
    /// Succeeded after the user canceled. Repetitive nodes are exempt; after
    /// the cleanup grace period everything still running is killed.
    pub async fn signal(&self, plan: &Arc<ExecutionGraph>, signal: i32, allow_override: bool) {
        info!(dag = %self.inner.ctx.dag.name, signal, "signaling dag run");
        self.set_canceled();
        for node in plan.nodes() {
            if node.status() == RunStatus::Running && !node.is_repetitive() {
                node.signal(signal, allow_override).await;
            }
        }
        self.spawn_cleanup_watchdog(plan);
    }

    async fn abort_run(&self, plan: &Arc<ExecutionGraph>, signal: i32) {
        self.set_canceled();
        for node in plan.nodes() {
            if node.status() == RunStatus::Running && !node.is_repetitive() {
                node.signal(signal, true).await;
            }
        }
        self.spawn_cleanup_watchdog(plan);
    }

    fn spawn_cleanup_watchdog(&self, plan: &Arc<ExecutionGraph>) {
        let grace = self.inner.ctx.dag.cleanup_timeout();
        let plan = plan.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for node in plan.nodes() {
                if node.status() == RunStatus::Running {
                    warn!(step = %node.name(), "cleanup grace period expired, killing");
                    node.cancel().await;
                }
            }
        });
    }

    /// Reduce the plan's node states to the run status.
    pub fn status(&self, plan: &ExecutionGraph) -> RunStatus {
        let (canceled, has_error) = {
            let state = self.inner.state.read();
            (state.canceled, state.last_error.is_some())
        };
        if canceled && !all_succeeded_or_skipped(plan) {
            return RunStatus::Aborted;
        }
        if !plan.is_started() {
            return RunStatus::NotStarted;
        }
        if plan.node_states().has_running {
            return RunStatus::Running;
        }
        if is_partial_success(plan) {
            return RunStatus::PartiallySucceeded;
        }
        if has_error {
            return RunStatus::Failed;
        }
        RunStatus::Succeeded
    }

    /// Build the persisted snapshot of the current state.
    pub fn build_status(&self, plan: &ExecutionGraph) -> DagRunStatus {
        let ctx = &self.inner.ctx;
        DagRunStatus {
            name: ctx.dag.name.clone(),
            dag_run_id: ctx.dag_run_id.clone(),
            attempt_id: ctx.attempt_id.clone(),
            status: self.status(plan),
            pid: std::process::id() as i32,
            started_at: Some(plan.started_at()),
            finished_at: plan.finished_at(),
            params: ctx.dag.params.join(" "),
            root: ctx.root.clone(),
            parent: ctx.parent.clone(),
            nodes: plan.nodes().iter().map(|n| n.snapshot()).collect(),
        }
    }

    async fn emit_progress(&self, node: &Arc<Node>) {
        let tx = self.inner.progress_tx.read().clone();
        if let Some(tx) = tx {
            // progress is advisory; a full channel drops the event rather
            // than stalling the loop
            if tx.try_send(node.snapshot()).is_err() {
                debug!(step = %node.name(), "progress channel full, dropping event");
            }
        }
    }

    async fn write_status(&self, plan: &ExecutionGraph) {
        let writer = self.inner.status_writer.read().clone();
        if let Some(writer) = writer {
            let status = self.build_status(plan);
            if let Err(e) = writer.write(&status).await {
                warn!(error = %e, "status writer failed");
            }
        }
    }

    /// Dispatch lifecycle handlers for the final status. Handler failures
    /// set `last_error` but never change the reported run status; `onExit`
    /// always runs last.
    async fn dispatch_handlers(&self, plan: &Arc<ExecutionGraph>) {
        let status = self.status(plan);
        let handlers = &self.inner.ctx.dag.handler_on;
        let mut selected: Vec<&Step> = Vec::new();
        match status {
            RunStatus::Succeeded | RunStatus::PartiallySucceeded => {
                selected.extend(handlers.success.as_ref());
            }
            RunStatus::Failed => selected.extend(handlers.failure.as_ref()),
            RunStatus::Aborted => selected.extend(handlers.cancel.as_ref()),
            _ => {}
        }
        selected.extend(handlers.exit.as_ref());
        if selected.is_empty() {
            return;
        }

        // handlers observe the DAG env, every step's outputs, and the final
        // status
        let mut scope = self.inner.base_scope.read().clone();
        for node in plan.nodes() {
            let outputs = node.output_variables();
            if !outputs.is_empty() {
                scope = scope.with_step_outputs(outputs, node.step().output_key());
            }
        }
        scope = scope.with_entry(ENV_KEY_RUN_STATUS, status.to_string(), VarSource::StepEnv);

        for step in selected {
            self.run_handler(step.clone(), &scope).await;
        }
    }

    async fn run_handler(&self, step: Step, scope: &Scope) {
        let ctx = &self.inner.ctx;
        debug!(handler = %step.name, "running lifecycle handler");
        let node = Arc::new(Node::new(step));
        node.claim_for_dispatch();

        if let Err(e) = node.prepare(ctx, scope).await {
            warn!(handler = %node.name(), error = %e, "handler prepare failed");
            node.mark_failed(&e);
            self.set_last_error(e);
            self.inner.handler_nodes.write().push(node);
            return;
        }

        // handlers run even on canceled runs, so they get their own
        // never-canceled signal
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        match node.execute(ctx, scope, cancel_rx).await {
            Ok(()) => node.finalize(false),
            Err(e) => {
                warn!(handler = %node.name(), error = %e, "handler failed");
                node.apply_execution_error(&e);
                self.set_last_error(e);
            }
        }
        if let Err(e) = node.teardown().await {
            warn!(handler = %node.name(), error = %e, "handler teardown failed");
        }
        self.inner.handler_nodes.write().push(node);
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

fn all_succeeded_or_skipped(plan: &ExecutionGraph) -> bool {
    plan.nodes()
        .iter()
        .all(|n| matches!(n.status(), RunStatus::Succeeded | RunStatus::Skipped))
}

/// Two-pass partial-success check: any failure without a continuation rules
/// it out; otherwise at least one success plus one tolerated failure (or a
/// partially-succeeded sub-run) makes the run partial.
fn is_partial_success(plan: &ExecutionGraph) -> bool {
    for node in plan.nodes() {
        if node.status() == RunStatus::Failed && !node.step().continue_on.is_set() {
            return false;
        }
    }

    let mut any_succeeded = false;
    let mut any_tolerated_failure = false;
    for node in plan.nodes() {
        match node.status() {
            RunStatus::Succeeded => any_succeeded = true,
            RunStatus::Failed if node.step().continue_on.is_set() => any_tolerated_failure = true,
            RunStatus::PartiallySucceeded => any_tolerated_failure = true,
            _ => {}
        }
    }
    any_succeeded && any_tolerated_failure
}

fn split_env_entry(entry: &str) -> Option<(String, String)> {
    let (key, value) = entry.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
