//! Per-step output pipeline: log files, redirects, masking and capture.
//!
//! Each node opens an [`OutputCoordinator`] during prepare. The coordinator
//! owns the step's stdout/stderr log files, the optional user-configured
//! redirect files, and (when the step declares an `output` variable) a
//! capture pipe whose reader runs concurrently with the writer so a chatty
//! child can never deadlock on a full pipe buffer. Reads past the configured
//! cap are discarded, keeping the child's writes flowing, and the captured
//! value is marked truncated.
//!
//! All writes go through the coordinator's mutex, so log files contain a
//! well-defined interleaving of stdout and stderr chunks. When secrets exist
//! in scope, every file write is scanned and secret literals are replaced
//! with `***` before touching disk.

use crate::error::{CoreError, Result};
use dagrun_model::StreamKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Marker appended to captured output that hit the size cap.
pub const OUTPUT_TRUNCATED_MARKER: &str = "[OUTPUT TRUNCATED]";

/// Pipe buffer for the capture stream; the concurrent reader keeps it
/// drained, the size only bounds one write burst.
const CAPTURE_PIPE_BUF: usize = 64 * 1024;

/// Replaces secret literals with `***`, longest match first.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    /// Secret values ordered longest first
    secrets: Vec<String>,
}

impl SecretMasker {
    /// Build a masker from secret values. Empty values are dropped; the rest
    /// are ordered longest-first so an overlapping shorter secret cannot
    /// leave a suffix of a longer one unmasked.
    pub fn new(mut secrets: Vec<String>) -> Self {
        secrets.retain(|s| !s.is_empty());
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Mask every secret occurrence in `text`.
    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), "***");
            }
        }
        out
    }
}

/// Everything needed to open a step's output pipeline.
#[derive(Debug, Clone)]
pub struct OutputSetup {
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub stdout_redirect: Option<PathBuf>,
    pub stderr_redirect: Option<PathBuf>,
    /// Arm the capture pipe (step declares an `output` variable)
    pub capture_output: bool,
    /// Cap on captured bytes per step
    pub max_output_size: usize,
    /// Secret values to mask in file writes
    pub secrets: Vec<String>,
}

struct Capture {
    writer: DuplexStream,
    reader: JoinHandle<(Vec<u8>, bool)>,
}

impl Capture {
    fn start(cap: usize) -> Self {
        let (writer, mut reader) = tokio::io::duplex(CAPTURE_PIPE_BUF);
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            let mut data: Vec<u8> = Vec::new();
            let mut truncated = false;
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if data.len() < cap {
                            let take = n.min(cap - data.len());
                            data.extend_from_slice(&buf[..take]);
                            if take < n {
                                truncated = true;
                            }
                        } else {
                            // keep draining so the writer never blocks
                            truncated = true;
                        }
                    }
                }
            }
            (data, truncated)
        });
        Self {
            writer,
            reader: handle,
        }
    }
}

struct Inner {
    stdout_log: Option<File>,
    stderr_log: Option<File>,
    stdout_redirect: Option<File>,
    stderr_redirect: Option<File>,
    capture: Option<Capture>,
    capture_enabled: bool,
    max_output_size: usize,
    masker: SecretMasker,
    /// Accumulated captured text across attempts, joined with newlines
    captured: Option<String>,
    truncated: bool,
    closed: bool,
}

/// Coordinates one step's output streams. Cheap to clone; all clones share
/// the same state behind one mutex.
#[derive(Clone)]
pub struct OutputCoordinator {
    inner: Arc<Mutex<Inner>>,
}

impl OutputCoordinator {
    /// Open log and redirect files (create/append) and arm the capture pipe
    /// when requested.
    pub async fn open(setup: OutputSetup) -> Result<Self> {
        let stdout_log = open_append(&setup.stdout_log).await?;
        let stderr_log = open_append(&setup.stderr_log).await?;
        let stdout_redirect = match &setup.stdout_redirect {
            Some(path) => Some(open_append(path).await?),
            None => None,
        };
        let stderr_redirect = match &setup.stderr_redirect {
            Some(path) => Some(open_append(path).await?),
            None => None,
        };
        let capture = setup
            .capture_output
            .then(|| Capture::start(setup.max_output_size));

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                stdout_log: Some(stdout_log),
                stderr_log: Some(stderr_log),
                stdout_redirect,
                stderr_redirect,
                capture,
                capture_enabled: setup.capture_output,
                max_output_size: setup.max_output_size,
                masker: SecretMasker::new(setup.secrets),
                captured: None,
                truncated: false,
                closed: false,
            })),
        })
    }

    /// The sink handed to the executor for one stream.
    pub fn sink(&self, kind: StreamKind) -> OutputSink {
        OutputSink {
            coordinator: self.clone(),
            kind,
        }
    }

    /// Write one chunk to every sink of the stream: log file, redirect, and
    /// (stdout only) the capture pipe. File writes are masked.
    pub async fn write(&self, kind: StreamKind, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "output coordinator is closed",
            )));
        }

        let masked: Vec<u8> = if inner.masker.is_empty() {
            data.to_vec()
        } else {
            inner
                .masker
                .mask(&String::from_utf8_lossy(data))
                .into_bytes()
        };

        match kind {
            StreamKind::Stdout => {
                if let Some(file) = inner.stdout_log.as_mut() {
                    file.write_all(&masked).await?;
                }
                if let Some(file) = inner.stdout_redirect.as_mut() {
                    file.write_all(&masked).await?;
                }
                if let Some(capture) = inner.capture.as_mut() {
                    // unmasked: the captured value feeds variables, not logs
                    capture.writer.write_all(data).await?;
                }
            }
            StreamKind::Stderr => {
                if let Some(file) = inner.stderr_log.as_mut() {
                    file.write_all(&masked).await?;
                }
                if let Some(file) = inner.stderr_redirect.as_mut() {
                    file.write_all(&masked).await?;
                }
            }
        }
        Ok(())
    }

    /// Close the capture writer, wait for the drain task, and fold the
    /// trimmed text into the accumulated captured output. Later attempts of
    /// the same step concatenate with a newline.
    ///
    /// Returns [`CoreError::OutputSizeExceeded`] when the cap was hit; the
    /// partial data is still retained and readable via [`Self::captured`].
    pub async fn finish_capture(&self) -> Result<()> {
        let (capture, cap) = {
            let mut inner = self.inner.lock().await;
            (inner.capture.take(), inner.max_output_size)
        };
        let Some(mut capture) = capture else {
            return Ok(());
        };

        // EOF for the reader
        let _ = capture.writer.shutdown().await;
        drop(capture.writer);
        let (data, truncated) = capture.reader.await.unwrap_or((Vec::new(), false));

        let text = String::from_utf8_lossy(&data).trim().to_string();
        let mut inner = self.inner.lock().await;
        inner.truncated |= truncated;
        match inner.captured.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(&text);
            }
            None => inner.captured = Some(text),
        }

        if truncated {
            Err(CoreError::OutputSizeExceeded { limit: cap })
        } else {
            Ok(())
        }
    }

    /// Arm a fresh capture pipe for the next attempt, keeping the text
    /// accumulated so far (retries concatenate across attempts). No-op when
    /// capture is disabled, already armed, or the coordinator is closed.
    pub async fn rearm_capture(&self) {
        let mut inner = self.inner.lock().await;
        if inner.capture_enabled && inner.capture.is_none() && !inner.closed {
            inner.capture = Some(Capture::start(inner.max_output_size));
        }
    }

    /// Arm a fresh capture pipe and discard the accumulated text. Repeat
    /// iterations start clean so conditions observe the live value.
    pub async fn reset_capture(&self) {
        let mut inner = self.inner.lock().await;
        inner.captured = None;
        inner.truncated = false;
        if inner.capture_enabled && inner.capture.is_none() && !inner.closed {
            inner.capture = Some(Capture::start(inner.max_output_size));
        }
    }

    /// The captured output accumulated so far. Idempotent; includes the
    /// truncation marker when the cap was hit.
    pub async fn captured(&self) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.captured.as_ref().map(|text| {
            if inner.truncated {
                if text.is_empty() {
                    OUTPUT_TRUNCATED_MARKER.to_string()
                } else {
                    format!("{} {}", text, OUTPUT_TRUNCATED_MARKER)
                }
            } else {
                text.clone()
            }
        })
    }

    /// Flush all open writers. Errors are coalesced into one.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let mut errors: Vec<String> = Vec::new();
        for file in [
            inner.stdout_log.as_mut(),
            inner.stderr_log.as_mut(),
            inner.stdout_redirect.as_mut(),
            inner.stderr_redirect.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = file.flush().await {
                errors.push(e.to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Io(std::io::Error::other(errors.join("; "))))
        }
    }

    /// Flush, finalize any open capture, and close every file. Idempotent;
    /// close itself is best-effort, but a size-exceeded capture is reported.
    pub async fn close(&self) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.closed {
                return Ok(());
            }
        }

        let flush_result = self.flush().await;
        let capture_result = self.finish_capture().await;

        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.stdout_log = None;
        inner.stderr_log = None;
        inner.stdout_redirect = None;
        inner.stderr_redirect = None;

        drop(inner);
        flush_result?;
        capture_result
    }
}

/// One stream's write handle, passed to the executor.
#[derive(Clone)]
pub struct OutputSink {
    coordinator: OutputCoordinator,
    kind: StreamKind,
}

impl OutputSink {
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.coordinator.write(self.kind, data).await
    }
}

async fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}
