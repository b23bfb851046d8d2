//! Layered variable scope with source-tagged precedence.
//!
//! A [`Scope`] is an append-only stack of immutable frames. Writes create a
//! new frame in front of the old ones, so snapshots are cheap and forks (one
//! per step task, plus handler contexts) never interfere with each other.
//!
//! Lookup does not simply take the newest entry: every entry carries the
//! [`VarSource`] it came from, and sources have a fixed precedence, highest
//! first:
//!
//! ```text
//! step-env > step-output > DAG-env > secret > base/OS
//! ```
//!
//! Within one source, newer frames shadow older ones.

use std::collections::HashMap;
use std::sync::Arc;

/// Where a variable entered the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarSource {
    /// Inherited OS environment
    Base,
    /// DAG-level secret
    Secret,
    /// DAG-level env entry
    DagEnv,
    /// Output variable captured from an upstream step
    StepOutput,
    /// Per-step env entry
    StepEnv,
}

impl VarSource {
    /// Precedence rank; higher wins.
    fn rank(&self) -> u8 {
        match self {
            VarSource::Base => 0,
            VarSource::Secret => 1,
            VarSource::DagEnv => 2,
            VarSource::StepOutput => 3,
            VarSource::StepEnv => 4,
        }
    }

    const ALL_DESCENDING: [VarSource; 5] = [
        VarSource::StepEnv,
        VarSource::StepOutput,
        VarSource::DagEnv,
        VarSource::Secret,
        VarSource::Base,
    ];
}

#[derive(Debug)]
struct Entry {
    key: String,
    value: String,
    source: VarSource,
    /// Producing step, for `StepOutput` entries
    step_id: Option<String>,
}

#[derive(Debug)]
struct Frame {
    parent: Option<Arc<Frame>>,
    entries: Vec<Entry>,
}

/// Immutable, forkable variable store.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    head: Option<Arc<Frame>>,
}

impl Scope {
    /// An empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope seeded with the current process environment as `Base` entries.
    pub fn with_os_env() -> Self {
        let entries = std::env::vars().collect::<HashMap<_, _>>();
        Self::new().with_entries(entries, VarSource::Base)
    }

    fn push(&self, entries: Vec<Entry>) -> Self {
        if entries.is_empty() {
            return self.clone();
        }
        Self {
            head: Some(Arc::new(Frame {
                parent: self.head.clone(),
                entries,
            })),
        }
    }

    /// Return a new scope with one additional entry.
    pub fn with_entry(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        source: VarSource,
    ) -> Self {
        self.push(vec![Entry {
            key: key.into(),
            value: value.into(),
            source,
            step_id: None,
        }])
    }

    /// Return a new scope with every map entry added under one source.
    pub fn with_entries(
        &self,
        entries: impl IntoIterator<Item = (String, String)>,
        source: VarSource,
    ) -> Self {
        self.push(
            entries
                .into_iter()
                .map(|(key, value)| Entry {
                    key,
                    value,
                    source,
                    step_id: None,
                })
                .collect(),
        )
    }

    /// Return a new scope with the output variables of one step, tagged with
    /// the producing step's stable ID.
    pub fn with_step_outputs(
        &self,
        outputs: impl IntoIterator<Item = (String, String)>,
        step_id: impl Into<String>,
    ) -> Self {
        let step_id = step_id.into();
        self.push(
            outputs
                .into_iter()
                .map(|(key, value)| Entry {
                    key,
                    value,
                    source: VarSource::StepOutput,
                    step_id: Some(step_id.clone()),
                })
                .collect(),
        )
    }

    fn frames(&self) -> impl Iterator<Item = &Frame> {
        struct Frames<'a> {
            next: Option<&'a Frame>,
        }
        impl<'a> Iterator for Frames<'a> {
            type Item = &'a Frame;
            fn next(&mut self) -> Option<&'a Frame> {
                let frame = self.next?;
                self.next = frame.parent.as_deref();
                Some(frame)
            }
        }
        Frames {
            next: self.head.as_deref(),
        }
    }

    /// Look up `key`, consulting sources in precedence order and, within one
    /// source, newest frames first.
    pub fn get(&self, key: &str) -> Option<String> {
        for source in VarSource::ALL_DESCENDING {
            for frame in self.frames() {
                // later entries within a frame shadow earlier ones
                if let Some(entry) = frame
                    .entries
                    .iter()
                    .rev()
                    .find(|e| e.source == source && e.key == key)
                {
                    return Some(entry.value.clone());
                }
            }
        }
        None
    }

    /// All visible entries from one source, shadowed duplicates removed.
    pub fn all_by_source(&self, source: VarSource) -> HashMap<String, String> {
        let mut out = HashMap::new();
        for frame in self.frames() {
            for entry in frame.entries.iter().rev() {
                if entry.source == source && !out.contains_key(&entry.key) {
                    out.insert(entry.key.clone(), entry.value.clone());
                }
            }
        }
        out
    }

    /// Values of every `Secret` entry, longest first, for the masking layer.
    pub fn secret_values(&self) -> Vec<String> {
        let mut values: Vec<String> = self
            .all_by_source(VarSource::Secret)
            .into_values()
            .filter(|v| !v.is_empty())
            .collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();
        values
    }

    /// Flatten into one map applying full precedence, for handing to a child
    /// process environment.
    pub fn to_env_map(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        // ascending precedence so higher sources overwrite lower ones
        for source in VarSource::ALL_DESCENDING.iter().rev() {
            for (key, value) in self.all_by_source(*source) {
                out.insert(key, value);
            }
        }
        out
    }
}
