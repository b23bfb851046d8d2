//! Argv construction for recursive sub-process invocations.
//!
//! Sub-DAG executors and whole-run retries re-invoke the host binary; this
//! builder formats the argv so every call site produces the same flags in
//! the same order.

use dagrun_model::DagRunRef;

/// Builds the argv for one recursive invocation.
#[derive(Debug, Clone)]
pub struct SubCmdBuilder {
    bin: String,
    subcommand: String,
    target: String,
    dag_run_id: Option<String>,
    root: Option<DagRunRef>,
    parent: Option<DagRunRef>,
    params: Option<String>,
    quiet: bool,
    no_queue: bool,
}

impl SubCmdBuilder {
    /// Start a child run of `dag_name` via `bin`.
    pub fn start(bin: impl Into<String>, dag_name: impl Into<String>) -> Self {
        Self::new(bin, "start", dag_name)
    }

    /// Retry a prior run of `dag_name` via `bin`.
    pub fn retry(bin: impl Into<String>, dag_name: impl Into<String>) -> Self {
        Self::new(bin, "retry", dag_name)
    }

    fn new(bin: impl Into<String>, subcommand: &str, target: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            subcommand: subcommand.to_string(),
            target: target.into(),
            dag_run_id: None,
            root: None,
            parent: None,
            params: None,
            quiet: false,
            no_queue: false,
        }
    }

    pub fn dag_run_id(mut self, id: impl Into<String>) -> Self {
        self.dag_run_id = Some(id.into());
        self
    }

    pub fn root(mut self, root: DagRunRef) -> Self {
        self.root = Some(root);
        self
    }

    pub fn parent(mut self, parent: DagRunRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn params(mut self, params: impl Into<String>) -> Self {
        let params = params.into();
        if !params.is_empty() {
            self.params = Some(params);
        }
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Bypass queueing so the child starts immediately under its parent.
    pub fn no_queue(mut self) -> Self {
        self.no_queue = true;
        self
    }

    /// The final argv, binary first.
    pub fn build(self) -> Vec<String> {
        let mut argv = vec![self.bin, self.subcommand];
        if let Some(id) = self.dag_run_id {
            argv.push(format!("--run-id={}", id));
        }
        if let Some(root) = self.root {
            argv.push(format!("--root={}:{}", root.name, root.id));
        }
        if let Some(parent) = self.parent {
            argv.push(format!("--parent={}:{}", parent.name, parent.id));
        }
        if self.quiet {
            argv.push("--quiet".to_string());
        }
        if self.no_queue {
            argv.push("--no-queue".to_string());
        }
        argv.push(self.target);
        if let Some(params) = self.params {
            argv.push("--".to_string());
            argv.push(params);
        }
        argv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_with_full_lineage() {
        let argv = SubCmdBuilder::start("/usr/bin/dagrun", "child-flow")
            .dag_run_id("abc123")
            .root(DagRunRef::new("root-flow", "root-1"))
            .parent(DagRunRef::new("parent-flow", "parent-1"))
            .quiet()
            .no_queue()
            .params("KEY=value")
            .build();

        assert_eq!(
            argv,
            vec![
                "/usr/bin/dagrun",
                "start",
                "--run-id=abc123",
                "--root=root-flow:root-1",
                "--parent=parent-flow:parent-1",
                "--quiet",
                "--no-queue",
                "child-flow",
                "--",
                "KEY=value",
            ]
        );
    }

    #[test]
    fn retry_is_minimal_without_options() {
        let argv = SubCmdBuilder::retry("dagrun", "flow")
            .dag_run_id("run-9")
            .build();
        assert_eq!(argv, vec!["dagrun", "retry", "--run-id=run-9", "flow"]);
    }

    #[test]
    fn empty_params_are_omitted() {
        let argv = SubCmdBuilder::start("dagrun", "flow").params("").build();
        assert!(!argv.contains(&"--".to_string()));
    }
}
