//! # dagrun-core - DAG Step Execution Engine
//!
//! **The execution core of dagrun**: a dependency-ordered scheduler over a
//! directed acyclic graph of steps, with per-step retry/repeat policies,
//! continuation rules, lifecycle handlers, and an output-capture layer that
//! feeds variables back into the graph.
//!
//! ## Overview
//!
//! `dagrun-core` takes a [`Dag`] definition and runs it:
//!
//! - **Dependency-ordered scheduling** - a child step never starts before
//!   all of its parents reach a terminal state
//! - **Bounded concurrency** - `max_active_steps` caps in-flight steps;
//!   everything else runs in parallel
//! - **Retry and repeat policies** - exponential backoff between retries,
//!   while/until loops with conditions evaluated against live outputs
//! - **Continuation rules** - `continue_on` converts upstream failures and
//!   skips into non-blocking signals for dependents
//! - **Layered environment** - step-env over upstream outputs over DAG env
//!   over secrets over the OS environment, with shell-style expansion
//! - **Output capture** - per-step log files, optional redirects, secret
//!   masking, and pipe-safe capped capture of stdout into variables
//! - **Lifecycle handlers** - `on_success`/`on_failure`/`on_cancel`/`on_exit`
//!   steps dispatched after the main loop
//!
//! ## Core Concepts
//!
//! ### 1. Plan and Runner
//!
//! A [`Dag`] compiles into an [`ExecutionGraph`] (the *plan*): runtime
//! [`Node`]s plus the dependency edges, validated acyclic at construction.
//! The [`Runner`] drives the plan with an event loop over ready/done
//! channels, spawning one task per dispatched node.
//!
//! ### 2. Node State Machine
//!
//! Every node moves through
//! `NotStarted → Running → {Succeeded, Failed, Aborted, Skipped}`; terminal
//! states are final. Retries and repeats re-enter `Running` between
//! attempts. A per-step timeout fails the step with exit code 124; the
//! run-level timeout aborts the run.
//!
//! ### 3. Scope
//!
//! [`Scope`] is an immutable stack of variable frames with source-tagged
//! precedence, so `${VAR}` in a step resolves against step-env first, then
//! upstream outputs, then DAG env, then secrets, then the OS environment.
//!
//! ### 4. External Interfaces
//!
//! The core is polymorphic over where work runs and where state goes:
//! executors implement [`Executor`] and register in an [`ExecutorRegistry`];
//! snapshots flow to any `dagrun_model::StatusWriter`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dagrun_core::{new_dag_run_id, ExecutionGraph, RunContext, Runner};
//! use dagrun_model::{Dag, Step};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> dagrun_core::Result<()> {
//!     let dag = Dag::new("etl")
//!         .with_step(Step::command("extract", "fetch.sh").with_output("ROWS"))
//!         .with_step(
//!             Step::command("load", "load.sh --rows=${ROWS}").depends_on("extract"),
//!         );
//!
//!     let plan = Arc::new(ExecutionGraph::new(dag.steps.clone())?);
//!     let runner = Runner::new(RunContext::new(dag, new_dag_run_id()));
//!     let status = runner.run(&plan).await?;
//!     println!("run finished: {}", status);
//!     Ok(())
//! }
//! ```

pub mod conditions;
pub mod context;
pub mod error;
pub mod eval;
pub mod exec;
pub mod graph;
pub mod node;
pub mod output;
pub mod scheduler;
pub mod scope;
pub mod subcmd;

pub use context::{new_dag_run_id, RunContext};
pub use error::{CoreError, Result};
pub use eval::{default_shell, EvalOptions};
pub use exec::{CommandExecutor, ExecSpec, Executor, ExecutorFactory, ExecutorRegistry};
pub use graph::{ExecutionGraph, NodeStateFlags};
pub use node::{Node, NodeState};
pub use output::{OutputCoordinator, OutputSetup, OutputSink, SecretMasker, OUTPUT_TRUNCATED_MARKER};
pub use scheduler::{Metrics, Runner, ENV_KEY_RUN_STATUS};
pub use scope::{Scope, VarSource};
pub use subcmd::SubCmdBuilder;

// the definition and status model types are re-exported so embedders only
// need one import path
pub use dagrun_model::{
    Condition, ContinueOn, Dag, DagRunRef, DagRunStatus, HandlerOn, NodeSnapshot, RepeatMode,
    RepeatPolicy, RetryPolicy, RunStatus, Step, SubDagRef,
};
