//! Per-run context: identifiers, directory and shell resolution, and the
//! environment keys injected into every step's child process.

use crate::error::Result;
use crate::eval::{default_shell, EvalOptions};
use crate::exec::ExecutorRegistry;
use crate::scope::Scope;
use dagrun_model::{Dag, DagRunRef, Step};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment key carrying the step name.
pub const ENV_KEY_STEP_NAME: &str = "DAG_RUN_STEP_NAME";
/// Environment key carrying the run ID.
pub const ENV_KEY_RUN_ID: &str = "DAG_RUN_ID";
/// Environment key carrying the DAG name.
pub const ENV_KEY_DAG_NAME: &str = "DAG_NAME";
/// Environment key carrying the step's stdout log file path.
pub const ENV_KEY_LOG_FILE: &str = "DAG_RUN_LOG_FILE";

/// Identity and resolution context for one DAG-run attempt.
#[derive(Clone)]
pub struct RunContext {
    pub dag: Arc<Dag>,
    pub dag_run_id: String,
    pub attempt_id: String,
    /// Root run of the sub-DAG tree
    pub root: DagRunRef,
    /// Direct parent run, when this run is a child
    pub parent: Option<DagRunRef>,
    /// Directory receiving per-step log files
    pub log_dir: PathBuf,
    pub registry: Arc<ExecutorRegistry>,
}

impl RunContext {
    pub fn new(dag: Dag, dag_run_id: impl Into<String>) -> Self {
        let dag_run_id = dag_run_id.into();
        let log_dir = dag
            .log_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("dagrun").join(&dag.name));
        let root = DagRunRef::new(&dag.name, &dag_run_id);
        Self {
            dag: Arc::new(dag),
            dag_run_id,
            attempt_id: uuid::Uuid::new_v4().to_string(),
            root,
            parent: None,
            log_dir,
            registry: Arc::new(ExecutorRegistry::with_defaults()),
        }
    }

    /// Mark this run as a child of another run.
    pub fn with_parent(mut self, root: DagRunRef, parent: DagRunRef) -> Self {
        self.root = root;
        self.parent = Some(parent);
        self
    }

    pub fn with_registry(mut self, registry: Arc<ExecutorRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Shell for a step: step override, then DAG default, then `$SHELL`,
    /// then `/bin/sh`.
    pub fn resolve_shell(&self, step: &Step) -> (String, Vec<String>) {
        let shell = step
            .shell
            .clone()
            .or_else(|| self.dag.shell.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_shell);
        (shell, step.shell_args.clone())
    }

    /// Evaluation options seen by a step's expansions and conditions.
    pub fn eval_options(&self, step: &Step, working_dir: Option<&Path>) -> EvalOptions {
        let (shell, shell_args) = self.resolve_shell(step);
        let mut opts = EvalOptions {
            shell,
            shell_args,
            working_dir: None,
        };
        if let Some(dir) = working_dir {
            opts = opts.with_working_dir(dir);
        }
        opts
    }

    /// Resolve a step's working directory: absolute stays as-is; relative is
    /// joined against the DAG working directory (default: the current
    /// directory); `~` and `$VAR` are expanded first.
    pub async fn resolve_working_dir(&self, step: &Step, scope: &Scope) -> Result<PathBuf> {
        let base = match &self.dag.working_dir {
            Some(dir) if !dir.is_empty() => {
                PathBuf::from(crate::eval::expand_tilde(dir))
            }
            _ => std::env::current_dir()?,
        };

        let Some(dir) = &step.dir else {
            return Ok(base);
        };
        let opts = self.eval_options(step, None);
        let expanded = scope.eval(&opts, dir).await?;
        let path = PathBuf::from(expanded);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(base.join(path))
        }
    }

    /// Log file paths (stdout, stderr) for one step of this attempt.
    pub fn log_paths(&self, step_name: &str) -> (PathBuf, PathBuf) {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%3f");
        let run = &self.dag_run_id[..self.dag_run_id.len().min(8)];
        let safe: String = step_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        (
            self.log_dir.join(format!("{}.{}.{}.out", safe, stamp, run)),
            self.log_dir.join(format!("{}.{}.{}.err", safe, stamp, run)),
        )
    }

    /// Environment keys injected into every step's child process, layered on
    /// top of the step's scope.
    pub fn child_env(
        &self,
        step_name: &str,
        stdout_log: &Path,
        working_dir: &Path,
    ) -> Vec<(String, String)> {
        vec![
            (ENV_KEY_STEP_NAME.to_string(), step_name.to_string()),
            (ENV_KEY_RUN_ID.to_string(), self.dag_run_id.clone()),
            (ENV_KEY_DAG_NAME.to_string(), self.dag.name.clone()),
            (
                ENV_KEY_LOG_FILE.to_string(),
                stdout_log.to_string_lossy().into_owned(),
            ),
            ("PWD".to_string(), working_dir.to_string_lossy().into_owned()),
        ]
    }

    /// Deterministic child-run ID: `base58(sha256(parent:step:params))`.
    ///
    /// Reruns of the same step land on the same child-run namespace. Repeat
    /// iterations mix in a random nonce so each loop iteration gets a
    /// distinct identity.
    pub fn child_run_id(&self, step_name: &str, params: &str, repeated: bool) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dag_run_id.as_bytes());
        hasher.update(b":");
        hasher.update(step_name.as_bytes());
        hasher.update(b":");
        hasher.update(params.as_bytes());
        if repeated {
            let nonce: [u8; 8] = rand::random();
            hasher.update(nonce);
        }
        bs58::encode(hasher.finalize()).into_string()
    }
}

/// A fresh random run ID.
pub fn new_dag_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::VarSource;

    fn context() -> RunContext {
        RunContext::new(Dag::new("demo"), "0123456789abcdef")
    }

    #[test]
    fn child_run_ids_are_deterministic() {
        let ctx = context();
        let a = ctx.child_run_id("fetch", "x=1", false);
        let b = ctx.child_run_id("fetch", "x=1", false);
        assert_eq!(a, b);

        let other_step = ctx.child_run_id("load", "x=1", false);
        let other_params = ctx.child_run_id("fetch", "x=2", false);
        assert_ne!(a, other_step);
        assert_ne!(a, other_params);
    }

    #[test]
    fn repeat_iterations_get_distinct_child_ids() {
        let ctx = context();
        let a = ctx.child_run_id("loop", "", true);
        let b = ctx.child_run_id("loop", "", true);
        assert_ne!(a, b);
    }

    #[test]
    fn shell_resolution_order() {
        let mut dag = Dag::new("demo");
        dag.shell = Some("/bin/bash".to_string());
        let ctx = RunContext::new(dag, "run");

        let mut step = Step::command("a", "true");
        assert_eq!(ctx.resolve_shell(&step).0, "/bin/bash");

        step.shell = Some("/bin/zsh".to_string());
        assert_eq!(ctx.resolve_shell(&step).0, "/bin/zsh");
    }

    #[tokio::test]
    async fn working_dir_resolution() {
        let mut dag = Dag::new("demo");
        dag.working_dir = Some("/tmp".to_string());
        let ctx = RunContext::new(dag, "run");
        let scope = Scope::new().with_entry("SUB", "nested", VarSource::DagEnv);

        let mut step = Step::command("a", "true");
        assert_eq!(
            ctx.resolve_working_dir(&step, &scope).await.unwrap(),
            PathBuf::from("/tmp")
        );

        step.dir = Some("${SUB}/dir".to_string());
        assert_eq!(
            ctx.resolve_working_dir(&step, &scope).await.unwrap(),
            PathBuf::from("/tmp/nested/dir")
        );

        step.dir = Some("/absolute".to_string());
        assert_eq!(
            ctx.resolve_working_dir(&step, &scope).await.unwrap(),
            PathBuf::from("/absolute")
        );
    }

    #[test]
    fn log_paths_embed_step_and_run() {
        let ctx = context();
        let (out, err) = ctx.log_paths("my step");
        let name = out.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("my_step."));
        assert!(name.contains("01234567"));
        assert!(name.ends_with(".out"));
        assert_eq!(err.extension().unwrap(), "err");
    }

    #[test]
    fn child_env_keys() {
        let ctx = context();
        let env = ctx.child_env("fetch", Path::new("/logs/fetch.out"), Path::new("/work"));
        let map: std::collections::HashMap<_, _> = env.into_iter().collect();
        assert_eq!(map[ENV_KEY_STEP_NAME], "fetch");
        assert_eq!(map[ENV_KEY_RUN_ID], "0123456789abcdef");
        assert_eq!(map[ENV_KEY_DAG_NAME], "demo");
        assert_eq!(map[ENV_KEY_LOG_FILE], "/logs/fetch.out");
        assert_eq!(map["PWD"], "/work");
    }
}
