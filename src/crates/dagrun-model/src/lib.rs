//! # dagrun-model - Definitions, Status Model and Sink Interfaces
//!
//! **The interface layer below the dagrun execution core.** This crate holds
//! everything that crosses a process or network boundary:
//!
//! - The static workflow definition types ([`Dag`], [`Step`] and the policy
//!   structs attached to steps) that are immutable during a run and embedded
//!   in persisted snapshots.
//! - The persisted status snapshot model ([`DagRunStatus`], [`NodeSnapshot`])
//!   whose JSON field names are part of the wire format and must be preserved
//!   bit-exactly by any sink.
//! - The [`StatusWriter`] and [`Database`] traits the core is polymorphic
//!   over, with in-memory reference implementations.
//! - The chunked log streaming layer ([`LogStreamer`], [`LogChunk`]) used
//!   when runs execute on remote workers.
//!
//! ## Overview
//!
//! The execution core (`dagrun-core`) consumes these types but never decides
//! where they are stored or shipped. Embedders implement [`StatusWriter`] to
//! persist attempt snapshots and [`LogSink`] to transport log chunks; the
//! in-memory implementations here are reference backends used throughout the
//! test suites.
//!
//! ```rust
//! use dagrun_model::{Dag, Step, RetryPolicy};
//!
//! let dag = Dag::new("etl")
//!     .with_step(Step::command("extract", "fetch.sh").with_output("ROWS"))
//!     .with_step(Step::command("load", "load.sh").depends_on("extract"));
//!
//! assert_eq!(dag.steps.len(), 2);
//! ```

pub mod definition;
pub mod error;
pub mod status;
pub mod stream;
pub mod writer;

pub use definition::{
    Condition, ContinueOn, Dag, ExecutorConfig, HandlerOn, RepeatMode, RepeatPolicy, RetryPolicy,
    Step, SubDagRef, DEFAULT_MAX_OUTPUT_SIZE,
};
pub use error::{ModelError, Result};
pub use status::{DagRunRef, DagRunStatus, NodeSnapshot, RunStatus, SubRun};
pub use stream::{
    InMemoryLogSink, LogChunk, LogSink, LogStreamer, StreamKind, StreamMeta, FLUSH_THRESHOLD,
    MAX_CHUNK_SIZE,
};
pub use writer::{Database, InMemoryDatabase, InMemoryStatusWriter, StatusWriter};
