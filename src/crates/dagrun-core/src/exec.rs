//! Executor plugins.
//!
//! The core is polymorphic over how a step actually runs: the scheduler only
//! needs `{run, signal, kill}`. Concrete executors are registered in an
//! [`ExecutorRegistry`] keyed by `Step.executor.type`; an empty type resolves
//! to the default shell-command executor. Sub-DAG, HTTP and container
//! executors plug in through the same factory interface.

use crate::error::{CoreError, Result};
use crate::output::OutputSink;
use async_trait::async_trait;
use dagrun_model::Step;
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::process::Command;

/// Everything a factory needs to build an executor for one attempt.
#[derive(Clone)]
pub struct ExecSpec {
    /// The step, with command/args/script already evaluated
    pub step: Step,
    pub working_dir: PathBuf,
    pub shell: String,
    pub shell_args: Vec<String>,
    /// Fully resolved child environment
    pub env: HashMap<String, String>,
    /// Directory where inline scripts are materialized
    pub script_dir: PathBuf,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

/// A running (or runnable) step invocation.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Start the work and block until it finishes. Returns the exit code;
    /// `Err` means the invocation itself failed (spawn error, I/O).
    async fn run(&self) -> Result<i32>;

    /// Forward a signal to the underlying work, if it is running.
    async fn signal(&self, signal: i32);

    /// Terminate immediately.
    async fn kill(&self);
}

/// Builds an executor from an [`ExecSpec`].
pub type ExecutorFactory = Arc<dyn Fn(ExecSpec) -> Result<Arc<dyn Executor>> + Send + Sync>;

/// Maps `Step.executor.type` to a factory.
#[derive(Clone)]
pub struct ExecutorRegistry {
    factories: HashMap<String, ExecutorFactory>,
}

impl ExecutorRegistry {
    /// Registry with the built-in command executor under `""` and
    /// `"command"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        let command: ExecutorFactory =
            Arc::new(|spec| Ok(Arc::new(CommandExecutor::new(spec)) as Arc<dyn Executor>));
        registry.register("", command.clone());
        registry.register("command", command);
        registry
    }

    /// Register (or replace) a factory for an executor type.
    pub fn register(&mut self, kind: impl Into<String>, factory: ExecutorFactory) {
        self.factories.insert(kind.into(), factory);
    }

    /// Build an executor for the step in `spec`.
    pub fn create(&self, spec: ExecSpec) -> Result<Arc<dyn Executor>> {
        let kind = spec.step.executor.kind.clone();
        let factory = self.factories.get(&kind).ok_or_else(|| {
            CoreError::Validation(format!("unknown executor type '{}'", kind))
        })?;
        factory(spec)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Default executor: runs the step's command line (or inline script) through
/// the resolved shell in its own process group, streaming stdout/stderr into
/// the step's output sinks.
pub struct CommandExecutor {
    spec: ExecSpec,
    /// Child pid while running; 0 otherwise. Signals target the process
    /// group so shell children are covered.
    pid: AtomicI32,
}

impl CommandExecutor {
    pub fn new(spec: ExecSpec) -> Self {
        Self {
            spec,
            pid: AtomicI32::new(0),
        }
    }

    async fn build_command(&self) -> Result<Command> {
        let step = &self.spec.step;
        let mut cmd = Command::new(&self.spec.shell);
        cmd.args(&self.spec.shell_args);

        if let Some(script) = &step.script {
            let path = self
                .spec
                .script_dir
                .join(format!("{}.{}.sh", sanitize(&step.name), uuid::Uuid::new_v4()));
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, script).await?;
            cmd.arg(path);
        } else if let Some(command) = &step.command {
            let mut line = command.clone();
            for arg in &step.args {
                line.push(' ');
                line.push_str(arg);
            }
            cmd.arg("-c").arg(line);
        } else {
            return Err(CoreError::Validation(format!(
                "step '{}' has neither command nor script",
                step.name
            )));
        }

        cmd.env_clear()
            .envs(&self.spec.env)
            .current_dir(&self.spec.working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd.as_std_mut().process_group(0);
        Ok(cmd)
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn run(&self) -> Result<i32> {
        let mut cmd = self.build_command().await?;
        let mut child = cmd.spawn()?;
        self.pid
            .store(child.id().map(|id| id as i32).unwrap_or(0), Ordering::SeqCst);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|stream| tokio::spawn(drain(stream, self.spec.stdout.clone())));
        let err_task = stderr.map(|stream| tokio::spawn(drain(stream, self.spec.stderr.clone())));

        let status = child.wait().await;
        self.pid.store(0, Ordering::SeqCst);

        // finish copying whatever is still buffered in the pipes
        if let Some(task) = out_task {
            let _ = task.await;
        }
        if let Some(task) = err_task {
            let _ = task.await;
        }

        let status = status?;
        Ok(exit_code_of(status))
    }

    async fn signal(&self, signal: i32) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            tracing::debug!(pid, signal, "signaling process group");
            unsafe {
                libc::kill(-pid, signal);
            }
        }
    }

    async fn kill(&self) {
        self.signal(libc::SIGKILL).await;
    }
}

async fn drain(mut stream: impl tokio::io::AsyncRead + Unpin, sink: OutputSink) {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Parse a signal name ("SIGTERM", "TERM") to its number.
pub fn signal_by_name(name: &str) -> Option<i32> {
    let name = name.trim().to_ascii_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    match name {
        "HUP" => Some(libc::SIGHUP),
        "INT" => Some(libc::SIGINT),
        "QUIT" => Some(libc::SIGQUIT),
        "KILL" => Some(libc::SIGKILL),
        "USR1" => Some(libc::SIGUSR1),
        "USR2" => Some(libc::SIGUSR2),
        "TERM" => Some(libc::SIGTERM),
        "CONT" => Some(libc::SIGCONT),
        "STOP" => Some(libc::SIGSTOP),
        _ => None,
    }
}
