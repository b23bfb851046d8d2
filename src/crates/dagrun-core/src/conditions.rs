//! Condition evaluation for preconditions and repeat policies.
//!
//! A [`Condition`] with a non-empty `expected` compares the evaluated
//! condition string against the evaluated expectation; an `re:` prefix on the
//! expectation switches to anchored regex matching. With an empty `expected`,
//! the condition string is run as a shell command and holds iff it exits 0.

use crate::error::{CoreError, Result};
use crate::eval::EvalOptions;
use crate::scope::Scope;
use dagrun_model::Condition;
use tokio::process::Command;

/// Evaluate one condition to met/unmet. Evaluation failures (bad regex,
/// unspawnable command) are errors, distinct from a cleanly unmet condition.
pub async fn evaluate(condition: &Condition, scope: &Scope, opts: &EvalOptions) -> Result<bool> {
    if condition.expected.is_empty() {
        return run_command_condition(&condition.condition, scope, opts).await;
    }

    let actual = scope.eval(opts, &condition.condition).await?;
    let expected = scope.eval(opts, &condition.expected).await?;

    if let Some(pattern) = expected.strip_prefix("re:") {
        let re = regex::Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| CoreError::Eval(format!("invalid condition pattern '{}': {}", pattern, e)))?;
        Ok(re.is_match(&actual))
    } else {
        Ok(actual == expected)
    }
}

/// Check every condition in order; the first unmet one is reported as
/// [`CoreError::PreconditionNotMet`].
pub async fn meets_all(conditions: &[Condition], scope: &Scope, opts: &EvalOptions) -> Result<()> {
    for condition in conditions {
        if !evaluate(condition, scope, opts).await? {
            return Err(CoreError::PreconditionNotMet(format!(
                "condition '{}' did not match '{}'",
                condition.condition,
                if condition.expected.is_empty() {
                    "exit 0"
                } else {
                    &condition.expected
                },
            )));
        }
    }
    Ok(())
}

async fn run_command_condition(command: &str, scope: &Scope, opts: &EvalOptions) -> Result<bool> {
    let expanded = scope.eval(opts, command).await?;
    let mut cmd = Command::new(&opts.shell);
    cmd.args(&opts.shell_args)
        .arg("-c")
        .arg(&expanded)
        .envs(scope.to_env_map())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(dir) = &opts.working_dir {
        cmd.current_dir(dir);
    }
    let status = cmd
        .status()
        .await
        .map_err(|e| CoreError::Eval(format!("condition command '{}': {}", expanded, e)))?;
    Ok(status.success())
}
