//! String evaluation against a [`Scope`].
//!
//! Supports shell-style variable substitution (`${VAR}` and `$VAR`),
//! backtick command substitution, and `~` expansion at the start of a path.
//! Referencing an undefined variable leaves the reference untouched, so
//! strings meant for the child shell pass through unharmed.
//!
//! Evaluation is side-effect-free except for backtick subcommands, which are
//! launched through the resolved shell with the scope's environment.

use crate::error::{CoreError, Result};
use crate::scope::Scope;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tokio::process::Command;

/// Shell used for backtick substitution and condition commands.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub shell: String,
    pub shell_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            shell_args: Vec::new(),
            working_dir: None,
        }
    }
}

impl EvalOptions {
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// The ambient shell: `$SHELL` when set, else `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Scope {
    /// Expand `s`: `~` at the start, `${VAR}`/`$VAR` references, then
    /// backtick command substitution.
    pub async fn eval(&self, opts: &EvalOptions, s: &str) -> Result<String> {
        let expanded = expand_vars(self, &expand_tilde(s));
        substitute_commands(self, opts, &expanded).await
    }

    /// Evaluate to a string and parse it as a boolean.
    ///
    /// Accepts `true/false`, `1/0`, `yes/no`, case-insensitive; anything else
    /// is an error.
    pub async fn eval_bool(&self, opts: &EvalOptions, s: &str) -> Result<bool> {
        let value = self.eval(opts, s).await?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(CoreError::Eval(format!(
                "not a boolean: '{}' (from '{}')",
                other, s
            ))),
        }
    }

    /// Expand every string leaf of a structured record with this scope.
    pub async fn eval_object<T>(&self, opts: &EvalOptions, object: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut value = serde_json::to_value(object)?;
        let mut stack = vec![&mut value];
        while let Some(current) = stack.pop() {
            match current {
                serde_json::Value::String(s) => {
                    *s = self.eval(opts, s).await?;
                }
                serde_json::Value::Array(items) => stack.extend(items.iter_mut()),
                serde_json::Value::Object(map) => stack.extend(map.values_mut()),
                _ => {}
            }
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(s: &str) -> String {
    if s == "~" || s.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}{}", home, &s[1..]);
        }
    }
    s.to_string()
}

/// Replace `${VAR}` and `$VAR` references with scope values. Undefined
/// variables are left as written.
pub fn expand_vars(scope: &Scope, s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    match scope.get(&name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push_str("${");
                            out.push_str(&name);
                            out.push('}');
                        }
                    }
                } else {
                    // unterminated brace, emit as-is
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match scope.get(&name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Run every `` `cmd` `` span through the shell and splice in its trimmed
/// stdout.
async fn substitute_commands(scope: &Scope, opts: &EvalOptions, s: &str) -> Result<String> {
    if !s.contains('`') {
        return Ok(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('`') {
        let Some(len) = rest[start + 1..].find('`') else {
            // unmatched backtick, keep the remainder literal
            break;
        };
        out.push_str(&rest[..start]);
        let command = &rest[start + 1..start + 1 + len];
        out.push_str(run_substitution(scope, opts, command).await?.trim());
        rest = &rest[start + 1 + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

async fn run_substitution(scope: &Scope, opts: &EvalOptions, command: &str) -> Result<String> {
    let mut cmd = Command::new(&opts.shell);
    cmd.args(&opts.shell_args)
        .arg("-c")
        .arg(command)
        .envs(scope.to_env_map())
        .stdin(std::process::Stdio::null());
    if let Some(dir) = &opts.working_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| CoreError::Eval(format!("command substitution '{}': {}", command, e)))?;
    if !output.status.success() {
        return Err(CoreError::Eval(format!(
            "command substitution '{}' exited with {}",
            command,
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
