//! End-to-end scheduler tests over real shell commands.
//!
//! These drive the full pipeline (plan construction, dispatch, scope setup,
//! process execution, output capture, handlers) in realistic scenarios.

use dagrun_core::{
    CoreError, Dag, ExecutionGraph, RunContext, Runner, RunStatus, Step,
};
use dagrun_model::{Condition, InMemoryStatusWriter, RepeatMode, RepeatPolicy, RetryPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

struct Harness {
    _dir: TempDir,
    runner: Runner,
    plan: Arc<ExecutionGraph>,
}

fn harness(mut dag: Dag) -> Harness {
    init_tracing();
    let dir = TempDir::new().unwrap();
    if dag.working_dir.is_none() {
        dag.working_dir = Some(dir.path().to_string_lossy().into_owned());
    }
    let plan = Arc::new(ExecutionGraph::new(dag.steps.clone()).unwrap());
    let ctx = RunContext::new(dag, dagrun_core::new_dag_run_id())
        .with_log_dir(dir.path().join("logs"));
    Harness {
        _dir: dir,
        runner: Runner::new(ctx),
        plan,
    }
}

fn status_of(h: &Harness, name: &str) -> RunStatus {
    h.plan.node_by_name(name).unwrap().status()
}

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() {
    let dag = Dag::new("chain")
        .with_step(Step::command("a", "true"))
        .with_step(Step::command("b", "true").depends_on("a"))
        .with_step(Step::command("c", "true").depends_on("b"));
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    for name in ["a", "b", "c"] {
        assert_eq!(status_of(&h, name), RunStatus::Succeeded);
    }

    let started = |name: &str| {
        h.plan
            .node_by_name(name)
            .unwrap()
            .state_snapshot()
            .started_at
            .unwrap()
    };
    assert!(started("a") <= started("b"));
    assert!(started("b") <= started("c"));
}

#[tokio::test]
async fn continue_on_failure_yields_partial_success() {
    let mut failing = Step::command("a", "false");
    failing.continue_on.failure = true;
    let dag = Dag::new("partial")
        .with_step(failing)
        .with_step(Step::command("b", "true").depends_on("a"));
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status_of(&h, "a"), RunStatus::Failed);
    assert_eq!(status_of(&h, "b"), RunStatus::Succeeded);
    assert_eq!(status, RunStatus::PartiallySucceeded);
}

#[tokio::test]
async fn upstream_failure_aborts_all_descendants() {
    let dag = Dag::new("abort-cascade")
        .with_step(Step::command("a", "false"))
        .with_step(Step::command("b", "true").depends_on("a"))
        .with_step(Step::command("c", "true").depends_on("b"));
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Failed);
    assert_eq!(status_of(&h, "a"), RunStatus::Failed);
    assert_eq!(status_of(&h, "b"), RunStatus::Aborted);
    assert_eq!(status_of(&h, "c"), RunStatus::Aborted);

    let b_error = h.plan.node_by_name("b").unwrap().state_snapshot().error;
    assert!(b_error.unwrap().contains("upstream step failed"));
}

#[tokio::test]
async fn upstream_skip_cascades_as_skip() {
    let mut gated = Step::command("a", "true");
    gated.preconditions = vec![Condition::new("no", "yes")];
    let dag = Dag::new("skip-cascade")
        .with_step(gated)
        .with_step(Step::command("b", "true").depends_on("a"));
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status_of(&h, "a"), RunStatus::Skipped);
    assert_eq!(status_of(&h, "b"), RunStatus::Skipped);
    assert_eq!(status, RunStatus::Succeeded, "an all-skipped run is clean");
}

#[tokio::test]
async fn output_variable_chains_to_downstream_stdout() {
    let dag = Dag::new("output-chain")
        .with_step(Step::command("a", "echo 42").with_output("X"))
        .with_step(Step::command("b", "echo ${X}").depends_on("a"));
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let b_state = h.plan.node_by_name("b").unwrap().state_snapshot();
    let log = std::fs::read_to_string(&b_state.stdout_log).unwrap();
    assert_eq!(log, "42\n");
}

#[tokio::test]
async fn step_env_beats_upstream_output_beats_dag_env() {
    let mut producer = Step::command("producer", "echo from-output");
    producer.output = Some("K".to_string());
    let mut consumer = Step::command("consumer", "echo ${K}")
        .depends_on("producer")
        .with_output("SEEN");
    consumer.env = vec!["K=from-step-env".to_string()];

    let mut dag = Dag::new("precedence")
        .with_step(producer.clone())
        .with_step(consumer);
    dag.env = vec!["K=from-dag-env".to_string()];
    let h = harness(dag);
    h.runner.run(&h.plan).await.unwrap();
    let seen = h.plan.node_by_name("consumer").unwrap().output_variables();
    assert_eq!(seen["SEEN"], "from-step-env");

    // without the step env, the upstream output wins
    let mut consumer = Step::command("consumer", "echo ${K}")
        .depends_on("producer")
        .with_output("SEEN");
    consumer.env = Vec::new();
    let mut dag = Dag::new("precedence")
        .with_step(producer.clone())
        .with_step(consumer);
    dag.env = vec!["K=from-dag-env".to_string()];
    let h = harness(dag);
    h.runner.run(&h.plan).await.unwrap();
    let seen = h.plan.node_by_name("consumer").unwrap().output_variables();
    assert_eq!(seen["SEEN"], "from-output");

    // without the output, the DAG env wins
    let consumer = Step::command("consumer", "echo ${K}")
        .depends_on("producer")
        .with_output("SEEN");
    let mut producer_quiet = producer;
    producer_quiet.output = None;
    let mut dag = Dag::new("precedence")
        .with_step(producer_quiet)
        .with_step(consumer);
    dag.env = vec!["K=from-dag-env".to_string()];
    let h = harness(dag);
    h.runner.run(&h.plan).await.unwrap();
    let seen = h.plan.node_by_name("consumer").unwrap().output_variables();
    assert_eq!(seen["SEEN"], "from-dag-env");
}

#[tokio::test]
async fn cycle_is_rejected_at_construction() {
    let steps = vec![
        Step::command("a", "true").depends_on("b"),
        Step::command("b", "true").depends_on("a"),
    ];
    assert!(matches!(
        ExecutionGraph::new(steps),
        Err(CoreError::CycleDetected)
    ));
}

#[tokio::test]
async fn step_timeout_fails_with_124_quickly() {
    let mut slow = Step::command("slow", "sleep 10");
    slow.timeout_secs = 0.1;
    let dag = Dag::new("timeout").with_step(slow);
    let h = harness(dag);

    let started = Instant::now();
    let status = h.runner.run(&h.plan).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(8));

    assert_eq!(status, RunStatus::Failed);
    let state = h.plan.node_by_name("slow").unwrap().state_snapshot();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.exit_code, 124);
}

#[tokio::test]
async fn repeat_until_exhausts_its_limit() {
    let mut looping = Step::command("loop", "exit 1");
    looping.repeat_policy = Some(RepeatPolicy {
        mode: Some(RepeatMode::Until),
        limit: 3,
        interval_secs: 0.01,
        ..Default::default()
    });
    let dag = Dag::new("repeat-until").with_step(looping);
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    let state = h.plan.node_by_name("loop").unwrap().state_snapshot();
    assert_eq!(state.done_count, 3);
    assert!(state.repeated);
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(status, RunStatus::Failed);
}

#[tokio::test]
async fn repeat_while_condition_reads_live_output() {
    let dir = TempDir::new().unwrap();
    let counter = dir.path().join("count");
    // emits the current iteration count; the while-condition keeps the loop
    // alive until the output stops matching
    let command = format!(
        "sh -c 'echo x >> {c}; wc -l < {c} | tr -d \" \"'",
        c = counter.display()
    );
    let mut looping = Step::command("loop", command).with_output("COUNT");
    looping.repeat_policy = Some(RepeatPolicy {
        mode: Some(RepeatMode::While),
        condition: Some(Condition::new("${COUNT}", "re:[12]")),
        interval_secs: 0.01,
        limit: 10,
        ..Default::default()
    });
    let dag = Dag::new("repeat-while").with_step(looping);
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    let state = h.plan.node_by_name("loop").unwrap().state_snapshot();
    assert_eq!(state.done_count, 3, "runs while count is 1 or 2, stops at 3");
}

#[tokio::test]
async fn max_active_one_serializes_independent_steps() {
    let mut dag = Dag::new("serial");
    for i in 0..5 {
        dag.steps.push(Step::command(format!("s{}", i), "sleep 0.05"));
    }
    dag.max_active_steps = 1;
    let h = harness(dag);

    let started = Instant::now();
    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert!(
        started.elapsed() >= Duration::from_millis(250),
        "five 50ms steps under a cap of one cannot overlap"
    );
}

#[tokio::test]
async fn unlimited_concurrency_overlaps_independent_steps() {
    let mut dag = Dag::new("parallel");
    for i in 0..5 {
        dag.steps.push(Step::command(format!("s{}", i), "sleep 0.05"));
    }
    let h = harness(dag);

    let started = Instant::now();
    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert!(
        started.elapsed() < Duration::from_millis(250),
        "with no cap the five sleeps overlap"
    );
}

#[tokio::test]
async fn retry_executes_limit_plus_one_attempts() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("attempts");
    let mut flaky = Step::command(
        "flaky",
        format!("sh -c 'echo x >> {}; exit 1'", marker.display()),
    );
    flaky.retry_policy = Some(RetryPolicy {
        limit: 2,
        interval_secs: 0.01,
        backoff: 2.0,
        ..Default::default()
    });
    let dag = Dag::new("retry").with_step(flaky);
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Failed);

    let attempts = std::fs::read_to_string(&marker).unwrap().lines().count();
    assert_eq!(attempts, 3, "limit 2 means three executions");
    let state = h.plan.node_by_name("flaky").unwrap().state_snapshot();
    assert_eq!(state.retry_count, 2);
    assert!(state.retried_at.is_some());
}

#[tokio::test]
async fn retry_recovers_when_a_later_attempt_passes() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("attempts");
    // fails on the first attempt, succeeds on the second
    let command = format!(
        "sh -c 'echo x >> {m}; test $(wc -l < {m}) -ge 2'",
        m = marker.display()
    );
    let mut flaky = Step::command("flaky", command);
    flaky.retry_policy = Some(RetryPolicy {
        limit: 3,
        interval_secs: 0.01,
        ..Default::default()
    });
    let dag = Dag::new("retry-recovers").with_step(flaky);
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    let state = h.plan.node_by_name("flaky").unwrap().state_snapshot();
    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.retry_count, 1);
}

#[tokio::test]
async fn cancel_aborts_inflight_and_pending_steps() {
    let dag = Dag::new("cancel")
        .with_step(Step::command("slow", "sleep 10"))
        .with_step(Step::command("after", "true").depends_on("slow"));
    let h = harness(dag);

    let runner = h.runner.clone();
    let plan = h.plan.clone();
    let run = tokio::spawn(async move { runner.run(&plan).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    h.runner.cancel(&h.plan).await;

    let status = run.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Aborted);
    assert_eq!(status_of(&h, "slow"), RunStatus::Aborted);
    assert_ne!(status_of(&h, "after"), RunStatus::Succeeded);
}

#[tokio::test]
async fn run_timeout_aborts_the_whole_dag() {
    let mut dag = Dag::new("run-timeout").with_step(Step::command("slow", "sleep 10"));
    dag.timeout_secs = 0.2;
    let h = harness(dag);

    let started = Instant::now();
    let status = h.runner.run(&h.plan).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(status, RunStatus::Aborted);
    assert!(matches!(
        h.runner.last_error().as_deref(),
        Some(CoreError::Canceled)
    ));
}

#[tokio::test]
async fn handlers_follow_the_final_status() {
    let mut dag = Dag::new("handlers-success").with_step(Step::command("a", "true"));
    dag.handler_on.success = Some(Step::command("on-success", "true"));
    dag.handler_on.failure = Some(Step::command("on-failure", "true"));
    dag.handler_on.exit = Some(Step::command("on-exit", "true"));
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    let handlers = h.runner.handler_results();
    let names: Vec<&str> = handlers.iter().map(|n| n.step.name.as_str()).collect();
    assert_eq!(names, vec!["on-success", "on-exit"], "onExit runs last");
    assert!(handlers.iter().all(|n| n.status == RunStatus::Succeeded));
}

#[tokio::test]
async fn handler_sees_final_status_and_outputs() {
    let mut dag = Dag::new("handler-env")
        .with_step(Step::command("a", "echo payload").with_output("RESULT"));
    dag.handler_on.exit =
        Some(Step::command("on-exit", "echo ${DAG_RUN_STATUS}:${RESULT}").with_output("HANDLER_SAW"));
    let h = harness(dag);

    h.runner.run(&h.plan).await.unwrap();
    let handlers = h.runner.handler_results();
    assert_eq!(
        handlers[0].output_variables["HANDLER_SAW"],
        "succeeded:payload"
    );
}

#[tokio::test]
async fn handler_failure_never_changes_the_reported_status() {
    let mut dag = Dag::new("handler-fails").with_step(Step::command("a", "true"));
    dag.handler_on.exit = Some(Step::command("on-exit", "exit 1"));
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded);
    assert!(h.runner.last_error().is_some(), "failure still recorded");
    assert_eq!(h.runner.handler_results()[0].status, RunStatus::Failed);
}

#[tokio::test]
async fn failure_dispatches_the_failure_handler() {
    let mut dag = Dag::new("handlers-failure").with_step(Step::command("a", "false"));
    dag.handler_on.success = Some(Step::command("on-success", "true"));
    dag.handler_on.failure = Some(Step::command("on-failure", "true"));
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Failed);
    let names: Vec<String> = h
        .runner
        .handler_results()
        .iter()
        .map(|n| n.step.name.clone())
        .collect();
    assert_eq!(names, vec!["on-failure"]);
}

#[tokio::test]
async fn dag_preconditions_gate_the_whole_run() {
    let mut dag = Dag::new("gated")
        .with_step(Step::command("a", "true"))
        .with_step(Step::command("b", "true").depends_on("a"));
    dag.preconditions = vec![Condition::new("staging", "production")];
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Aborted);
    assert_eq!(status_of(&h, "a"), RunStatus::Aborted);
    assert_eq!(status_of(&h, "b"), RunStatus::Aborted);
    assert_eq!(h.runner.metrics().dispatched, 0);
}

#[tokio::test]
async fn status_writer_receives_progress_and_final_snapshot() {
    let writer = Arc::new(InMemoryStatusWriter::new());
    let dag = Dag::new("snapshots")
        .with_step(Step::command("a", "true"))
        .with_step(Step::command("b", "true").depends_on("a"));
    let h = harness(dag);
    let runner = h.runner.clone().with_status_writer(writer.clone());

    runner.run(&h.plan).await.unwrap();

    assert!(!writer.is_empty());
    let last = writer.latest().unwrap();
    assert_eq!(last.status, RunStatus::Succeeded);
    assert_eq!(last.nodes.len(), 2);
    assert!(last.finished_at.is_some());
    assert_eq!(last.name, "snapshots");
}

#[tokio::test]
async fn progress_stream_carries_node_snapshots() {
    use tokio_stream::StreamExt;

    let dag = Dag::new("progress").with_step(Step::command("a", "true"));
    let h = harness(dag);
    let mut progress = h.runner.progress_stream(16);

    h.runner.run(&h.plan).await.unwrap();

    let mut saw_terminal = false;
    while let Ok(Some(snapshot)) =
        tokio::time::timeout(Duration::from_millis(100), progress.next()).await
    {
        if snapshot.step.name == "a" && snapshot.status == RunStatus::Succeeded {
            saw_terminal = true;
        }
    }
    assert!(saw_terminal, "the completion snapshot must be replicated");
}

#[tokio::test]
async fn secrets_are_masked_in_step_logs() {
    let mut dag = Dag::new("secrets").with_step(Step::command("leak", "echo token=hunter2"));
    dag.secrets = vec!["TOKEN=hunter2".to_string()];
    let h = harness(dag);

    h.runner.run(&h.plan).await.unwrap();
    let state = h.plan.node_by_name("leak").unwrap().state_snapshot();
    let log = std::fs::read_to_string(&state.stdout_log).unwrap();
    assert_eq!(log, "token=***\n");
}

#[tokio::test]
async fn oversized_output_is_truncated_and_marked_but_not_fatal() {
    let mut dag = Dag::new("big-output")
        .with_step(Step::command("big", "yes x | head -c 4096").with_output("BIG"));
    dag.max_output_size = 64;
    let h = harness(dag);

    let status = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(status, RunStatus::Succeeded, "truncation alone never fails a step");

    let outputs = h.plan.node_by_name("big").unwrap().output_variables();
    let value = &outputs["BIG"];
    assert!(value.ends_with(dagrun_core::OUTPUT_TRUNCATED_MARKER));
}

#[tokio::test]
async fn deadlock_from_corrupted_state_is_reported_not_hung() {
    let dag = Dag::new("deadlock")
        .with_step(Step::command("a", "true"))
        .with_step(Step::command("b", "true").depends_on("a"));
    let h = harness(dag);

    // simulate a corrupted plan: the root claims Running without a task
    h.plan.node_by_name("a").unwrap().set_status(RunStatus::Running);

    let run = tokio::time::timeout(Duration::from_secs(5), h.runner.run(&h.plan)).await;
    assert!(run.is_ok(), "the loop must exit rather than hang");
    assert!(matches!(
        h.runner.last_error().as_deref(),
        Some(CoreError::DeadlockDetected)
    ));
}

#[tokio::test]
async fn retry_graph_reruns_only_the_failed_suffix() {
    let dir = TempDir::new().unwrap();
    let gate = dir.path().join("gate");
    let a_marker = dir.path().join("a-runs");
    let dag = Dag::new("rerun")
        .with_step(Step::command(
            "a",
            format!("sh -c 'echo x >> {}'", a_marker.display()),
        ))
        .with_step(
            Step::command("b", format!("test -f {}", gate.display())).depends_on("a"),
        );
    let h = harness(dag.clone());

    let first = h.runner.run(&h.plan).await.unwrap();
    assert_eq!(first, RunStatus::Failed);
    assert_eq!(status_of(&h, "b"), RunStatus::Failed);

    // unblock b, then retry from the prior run's nodes
    std::fs::write(&gate, "open").unwrap();
    let retry_plan =
        Arc::new(ExecutionGraph::create_retry_graph(h.plan.nodes().to_vec()).unwrap());
    assert_eq!(
        retry_plan.node_by_name("a").unwrap().status(),
        RunStatus::Succeeded
    );

    let ctx = RunContext::new(dag, dagrun_core::new_dag_run_id())
        .with_log_dir(dir.path().join("logs"));
    let second = Runner::new(ctx).run(&retry_plan).await.unwrap();
    assert_eq!(second, RunStatus::Succeeded);

    let a_runs = std::fs::read_to_string(&a_marker).unwrap().lines().count();
    assert_eq!(a_runs, 1, "the succeeded step must not run again");
}
