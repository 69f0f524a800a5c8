use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ids::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

struct ContextInner {
    request_id: RequestId,
    started_at: Instant,
    verbosity: Verbosity,
    log_path: Option<PathBuf>,
    sink: Mutex<Box<dyn Write + Send>>,
}

/// Per-request output state. Never shared between requests: each request gets
/// its own instance, and work dispatched onto shared pools captures a clone
/// of the handle into the work item.
#[derive(Clone)]
pub struct BuildContext {
    inner: Arc<ContextInner>,
}

tokio::task_local! {
    static CURRENT_CONTEXT: BuildContext;
}

impl BuildContext {
    pub fn new(
        request_id: RequestId,
        verbosity: Verbosity,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id,
                started_at: Instant::now(),
                verbosity,
                log_path: None,
                sink: Mutex::new(sink),
            }),
        }
    }

    pub fn with_log_file(
        request_id: RequestId,
        verbosity: Verbosity,
        log_path: &Path,
    ) -> std::io::Result<Self> {
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                request_id,
                started_at: Instant::now(),
                verbosity,
                log_path: Some(log_path.to_path_buf()),
                sink: Mutex::new(Box::new(file)),
            }),
        })
    }

    /// Context plus a buffer the test can inspect afterwards.
    pub fn in_memory(
        request_id: RequestId,
        verbosity: Verbosity,
    ) -> (Self, Arc<Mutex<Vec<u8>>>) {
        #[derive(Clone)]
        struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

        impl Write for SharedBuffer {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0
                    .lock()
                    .expect("context buffer lock poisoned")
                    .extend_from_slice(data);
                Ok(data.len())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let context = Self::new(
            request_id,
            verbosity,
            Box::new(SharedBuffer(Arc::clone(&buffer))),
        );
        (context, buffer)
    }

    pub fn request_id(&self) -> &RequestId {
        &self.inner.request_id
    }

    pub fn verbosity(&self) -> Verbosity {
        self.inner.verbosity
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.inner.log_path.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn emit(&self, line: &str) {
        if self.inner.verbosity == Verbosity::Quiet {
            return;
        }
        self.write_line(line);
    }

    pub fn emit_verbose(&self, line: &str) {
        if self.inner.verbosity < Verbosity::Verbose {
            return;
        }
        self.write_line(line);
    }

    fn write_line(&self, line: &str) {
        let stamp = self.elapsed().as_secs_f64();
        let mut sink = self.inner.sink.lock().expect("context sink lock poisoned");
        let _ = writeln!(sink, "[{stamp:8.3}] {line}");
        let _ = sink.flush();
    }

    /// Run a future with this context installed as the task-local ambient
    /// context for the request's logical execution flow.
    pub async fn scope<F>(&self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CURRENT_CONTEXT.scope(self.clone(), fut).await
    }

    /// `scope` variant that owns the context, for handing to `tokio::spawn`.
    pub async fn scope_owned<F>(self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CURRENT_CONTEXT.scope(self, fut).await
    }

    /// The ambient context of the current task, if one is installed.
    pub fn current() -> Option<BuildContext> {
        CURRENT_CONTEXT.try_with(|context| context.clone()).ok()
    }
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("request_id", &self.inner.request_id)
            .field("verbosity", &self.inner.verbosity)
            .field("log_path", &self.inner.log_path)
            .finish()
    }
}
