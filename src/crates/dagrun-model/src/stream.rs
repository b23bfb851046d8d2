//! Chunked log streaming to a remote sink.
//!
//! When a run executes on a remote worker, step output is shipped to the
//! coordinator as a sequence of [`LogChunk`]s per (step, stream). The wire
//! contract:
//!
//! - chunks carry a per-stream `sequence` that is monotonic from 1 with no
//!   gaps;
//! - payloads never exceed [`MAX_CHUNK_SIZE`]; a larger buffer is split into
//!   consecutive chunks that each take the next sequence number;
//! - a final empty chunk with `is_final = true` concludes each stream, and at
//!   most one such chunk is emitted per stream;
//! - closing the streamer twice is a no-op after the first.
//!
//! Buffered writes are flushed once [`FLUSH_THRESHOLD`] bytes accumulate, so
//! chatty steps do not produce a chunk per line.

use crate::error::{ModelError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Buffered bytes per stream before an automatic flush (32 KiB).
pub const FLUSH_THRESHOLD: usize = 32 * 1024;

/// Maximum payload of a single chunk (3 MiB).
pub const MAX_CHUNK_SIZE: usize = 3 * 1024 * 1024;

/// Which child stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Wire encoding: stdout = 1, stderr = 2.
    pub fn code(&self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

/// One chunk of step output on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    #[serde(rename = "workerID")]
    pub worker_id: String,

    #[serde(rename = "dagRunID")]
    pub dag_run_id: String,

    pub dag_name: String,

    pub step_name: String,

    /// 1 = stdout, 2 = stderr
    pub stream_type: u8,

    pub data: String,

    /// Monotonic from 1, gap-free per (step, stream)
    pub sequence: u64,

    pub is_final: bool,

    pub root_dag_run_name: String,

    #[serde(rename = "rootDagRunID")]
    pub root_dag_run_id: String,

    #[serde(rename = "attemptID")]
    pub attempt_id: String,
}

/// Identity fields stamped on every chunk of a step's streams.
#[derive(Debug, Clone, Default)]
pub struct StreamMeta {
    pub worker_id: String,
    pub dag_run_id: String,
    pub dag_name: String,
    pub step_name: String,
    pub root_dag_run_name: String,
    pub root_dag_run_id: String,
    pub attempt_id: String,
}

/// Transport for log chunks.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn send(&self, chunk: LogChunk) -> Result<()>;
}

/// In-memory [`LogSink`] collecting chunks, for tests.
#[derive(Default)]
pub struct InMemoryLogSink {
    chunks: parking_lot::Mutex<Vec<LogChunk>>,
}

impl InMemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> Vec<LogChunk> {
        self.chunks.lock().clone()
    }
}

#[async_trait]
impl LogSink for InMemoryLogSink {
    async fn send(&self, chunk: LogChunk) -> Result<()> {
        self.chunks.lock().push(chunk);
        Ok(())
    }
}

struct StreamState {
    buffer: String,
    sequence: u64,
}

impl StreamState {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            sequence: 0,
        }
    }
}

/// Buffers one step's stdout/stderr and ships them as [`LogChunk`]s.
pub struct LogStreamer {
    sink: Arc<dyn LogSink>,
    meta: StreamMeta,
    stdout: StreamState,
    stderr: StreamState,
    flush_threshold: usize,
    max_chunk_size: usize,
    closed: bool,
}

impl LogStreamer {
    pub fn new(sink: Arc<dyn LogSink>, meta: StreamMeta) -> Self {
        Self {
            sink,
            meta,
            stdout: StreamState::new(),
            stderr: StreamState::new(),
            flush_threshold: FLUSH_THRESHOLD,
            max_chunk_size: MAX_CHUNK_SIZE,
            closed: false,
        }
    }

    /// Override the buffering limits (primarily for tests and tuning).
    pub fn with_limits(mut self, flush_threshold: usize, max_chunk_size: usize) -> Self {
        self.flush_threshold = flush_threshold;
        self.max_chunk_size = max_chunk_size.max(1);
        self
    }

    /// Append `text` to the stream buffer, flushing when the threshold is hit.
    pub async fn write(&mut self, kind: StreamKind, text: &str) -> Result<()> {
        if self.closed {
            return Err(ModelError::Sink("log stream already closed".to_string()));
        }
        let threshold = self.flush_threshold;
        let state = self.state_mut(kind);
        state.buffer.push_str(text);
        if state.buffer.len() >= threshold {
            self.flush(kind).await?;
        }
        Ok(())
    }

    /// Ship the buffered data for one stream, splitting payloads larger than
    /// the chunk cap. Each emitted chunk takes the next sequence number.
    pub async fn flush(&mut self, kind: StreamKind) -> Result<()> {
        let max = self.max_chunk_size;
        let data = std::mem::take(&mut self.state_mut(kind).buffer);
        if data.is_empty() {
            return Ok(());
        }

        let mut rest = data.as_str();
        while !rest.is_empty() {
            let take = if rest.len() <= max {
                rest.len()
            } else {
                // back off to a char boundary so the payload stays valid UTF-8
                let mut end = max;
                while !rest.is_char_boundary(end) {
                    end -= 1;
                }
                end
            };
            let (piece, tail) = rest.split_at(take);
            rest = tail;
            self.emit(kind, piece.to_string(), false).await?;
        }
        Ok(())
    }

    /// Flush both streams and conclude each with an empty `is_final` chunk.
    /// Idempotent: the second and later calls do nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for kind in [StreamKind::Stdout, StreamKind::Stderr] {
            self.flush(kind).await?;
            self.emit(kind, String::new(), true).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, kind: StreamKind, data: String, is_final: bool) -> Result<()> {
        let state = self.state_mut(kind);
        state.sequence += 1;
        let sequence = state.sequence;
        let chunk = LogChunk {
            worker_id: self.meta.worker_id.clone(),
            dag_run_id: self.meta.dag_run_id.clone(),
            dag_name: self.meta.dag_name.clone(),
            step_name: self.meta.step_name.clone(),
            stream_type: kind.code(),
            data,
            sequence,
            is_final,
            root_dag_run_name: self.meta.root_dag_run_name.clone(),
            root_dag_run_id: self.meta.root_dag_run_id.clone(),
            attempt_id: self.meta.attempt_id.clone(),
        };
        self.sink.send(chunk).await
    }

    fn state_mut(&mut self, kind: StreamKind) -> &mut StreamState {
        match kind {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }
}
