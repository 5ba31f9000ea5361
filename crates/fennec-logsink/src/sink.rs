//! File sink lifecycle: open, rotate, finalize and stop
//!
//! A [`FileSink`] owns exactly one active file at a time. It comes into being
//! open through [`FileSink::start`] and moves through
//! `Open -> (Rotating -> Open)* -> Stopped`. Every file that stops
//! being written, through rotation or stop, is finalized once: routed to its
//! final name and, when compression is configured, handed to exactly one
//! compression job.

use crate::{
    compression::{self, CompressionJob, Transform},
    config::{CompressionErrorCallback, CompressionMode, SinkConfig},
    path::{self, PathTemplate},
    retention::RetentionManager,
    rotation::{self, FileState},
    Error, Result,
};
use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

/// Lifecycle state of a started sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Open,
    Rotating,
    Stopped,
}

/// Counters describing what a sink has done so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub bytes_written: u64,
    pub rotations: u64,
    pub compressions: u64,
    pub compression_failures: u64,
    pub files_removed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_written: AtomicU64,
    rotations: AtomicU64,
    compressions: AtomicU64,
    compression_failures: AtomicU64,
    files_removed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SinkStats {
        SinkStats {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            compression_failures: self.compression_failures.load(Ordering::Relaxed),
            files_removed: self.files_removed.load(Ordering::Relaxed),
        }
    }
}

/// Files retention must leave alone: the active file and every finalized
/// file still waiting for its compression job
///
/// Retention holds the lock for a whole cleanup pass and the sink holds it
/// while it renames, opens and registers files.
#[derive(Debug, Default)]
struct ProtectedFiles(Mutex<HashSet<PathBuf>>);

impl ProtectedFiles {
    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, path: &Path) {
        self.lock().remove(path);
    }
}

/// The file currently receiving records
#[derive(Debug)]
struct ActiveFile {
    path: PathBuf,
    file: File,
    size: u64,
    created_at: DateTime<Utc>,
}

impl ActiveFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        Self::open_at(path, Utc::now())
    }

    fn open_at(path: PathBuf, created_at: DateTime<Utc>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();

        debug!(
            logsink.event = "file_opened",
            file_path = %path.display(),
            current_size = size,
            "Log file opened"
        );

        Ok(Self {
            path,
            file,
            size,
            created_at,
        })
    }

    fn state(&self) -> FileState {
        FileState {
            size: self.size,
            created_at: self.created_at,
        }
    }

    /// Flush and close the handle, keeping what is needed to reopen it
    fn close(mut self) -> (io::Result<()>, PathBuf, DateTime<Utc>) {
        let flushed = self.file.flush();
        (flushed, self.path, self.created_at)
    }
}

/// Everything a compression job needs once it leaves the sink
#[derive(Clone)]
struct JobContext {
    counters: Arc<Counters>,
    retention: Option<RetentionManager>,
    log_dir: PathBuf,
    files: Arc<ProtectedFiles>,
    on_error: Option<CompressionErrorCallback>,
}

impl JobContext {
    fn run(&self, job: Option<CompressionJob>) {
        if let Some(job) = job {
            let source = job.source().to_path_buf();
            let outcome = job.run();
            self.files.release(&source);

            match outcome {
                Ok(artifact) => {
                    self.counters.compressions.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("fennec.logsink.compressions").increment(1);
                    info!(
                        logsink.event = "file_compressed",
                        source = %source.display(),
                        artifact = ?artifact,
                        "Log file compressed"
                    );
                }
                Err(e) => {
                    self.counters
                        .compression_failures
                        .fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("fennec.logsink.compression_failures").increment(1);
                    error!(
                        logsink.event = "compression_failed",
                        source = %source.display(),
                        error = %e,
                        "Failed to compress log file"
                    );
                    if let Some(callback) = &self.on_error {
                        callback(&e);
                    }
                    return;
                }
            }
        }

        self.apply_retention();
    }

    fn apply_retention(&self) {
        let Some(retention) = &self.retention else {
            return;
        };

        let protected = self.files.lock();
        match retention.perform_cleanup(&self.log_dir, &protected) {
            Ok(report) => {
                self.counters
                    .files_removed
                    .fetch_add(u64::from(report.total_files_removed()), Ordering::Relaxed);
            }
            Err(e) => {
                warn!(
                    logsink.event = "retention_failed",
                    log_dir = %self.log_dir.display(),
                    error = %e,
                    "Failed to apply log retention"
                );
            }
        }
    }
}

/// Single background thread running compression jobs in submission order
struct CompressionWorker {
    sender: mpsc::Sender<CompressionJob>,
    handle: JoinHandle<()>,
}

impl CompressionWorker {
    fn spawn(context: JobContext) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<CompressionJob>();
        let handle = std::thread::Builder::new()
            .name("fennec-logsink-compress".to_string())
            .spawn(move || {
                // Events from this thread must not wait on a SharedSink lock
                // held by stop() while it joins us
                SERVING.with(|serving| serving.set(true));
                for job in receiver {
                    context.run(Some(job));
                }
            })?;

        Ok(Self { sender, handle })
    }

    /// Queue a job, handing it back when the worker is gone
    fn submit(&self, job: CompressionJob) -> std::result::Result<(), CompressionJob> {
        self.sender.send(job).map_err(|mpsc::SendError(job)| job)
    }

    /// Wait until every queued job has run
    fn shutdown(self) -> std::thread::Result<()> {
        drop(self.sender);
        self.handle.join()
    }
}

/// A single-writer log file sink
pub struct FileSink {
    config: SinkConfig,
    template: PathTemplate,
    transform: Option<Transform>,
    state: SinkState,
    active: Option<ActiveFile>,
    rotation_index: u32,
    context: JobContext,
    worker: Option<CompressionWorker>,
}

impl FileSink {
    /// Validate `config` and open the first file
    ///
    /// The compression specifier is resolved before anything touches the
    /// filesystem, so an invalid one leaves no file behind.
    pub fn start(config: SinkConfig) -> Result<Self> {
        let transform = config
            .compression
            .as_ref()
            .map(compression::resolve)
            .transpose()?;
        let template = PathTemplate::parse(&config.path_template)?;
        let retention = if config.retention.is_enabled() {
            Some(RetentionManager::new(config.retention.clone(), &template)?)
        } else {
            None
        };

        let context = JobContext {
            counters: Arc::new(Counters::default()),
            retention,
            log_dir: template.dir().to_path_buf(),
            files: Arc::new(ProtectedFiles::default()),
            on_error: config.on_compression_error.clone(),
        };
        let worker = match (config.compression_mode, &transform) {
            (CompressionMode::Background, Some(_)) => {
                Some(CompressionWorker::spawn(context.clone())?)
            }
            _ => None,
        };

        let rotation_index = 1;
        let active = ActiveFile::open(next_path(&template, rotation_index))?;
        context.files.lock().insert(active.path.clone());

        info!(
            logsink.event = "sink_started",
            file_path = %active.path.display(),
            rotation = ?config.rotation,
            compression = transform.as_ref().map(|t| t.label()),
            "Log sink started"
        );

        Ok(Self {
            config,
            template,
            transform,
            state: SinkState::Open,
            active: Some(active),
            rotation_index,
            context,
            worker,
        })
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Path of the file currently receiving records
    pub fn path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.path.as_path())
    }

    /// 1-based index of the active file within this sink's lifetime
    pub fn rotation_index(&self) -> u32 {
        self.rotation_index
    }

    pub fn stats(&self) -> SinkStats {
        self.context.counters.snapshot()
    }

    /// Write one pre-formatted record, rotating first when the policy says so
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        self.write_at(record, Utc::now())
    }

    /// Write one record, evaluating time-based rotation against `now`
    pub fn write_at(&mut self, record: &[u8], now: DateTime<Utc>) -> Result<()> {
        self.ensure_open()?;

        let incoming = record.len() as u64;
        let state = self.ensure_active()?.state();
        if rotation::should_rotate(&state, &self.config.rotation, incoming, now) {
            self.rotate()?;
        }

        let active = self.ensure_active()?;
        active.file.write_all(record)?;
        active.size += incoming;

        self.context
            .counters
            .bytes_written
            .fetch_add(incoming, Ordering::Relaxed);
        metrics::counter!("fennec.logsink.bytes_written").increment(incoming);

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_active()?.file.flush()?;
        Ok(())
    }

    /// Finalize the active file and continue on a fresh one
    ///
    /// On error the sink keeps writing to the previous file.
    pub fn rotate(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_active()?;

        self.state = SinkState::Rotating;
        let result = self.rotate_active();
        self.state = SinkState::Open;
        result
    }

    fn rotate_active(&mut self) -> Result<()> {
        let files = Arc::clone(&self.context.files);
        let mut protected = files.lock();

        let previous = self.active.take().ok_or_else(no_active_file)?;
        let (flushed, closed_path, created_at) = previous.close();
        if let Err(e) = flushed {
            self.restore(&closed_path, &closed_path, created_at);
            return Err(e.into());
        }

        let finalized = match self.route_finalized(&closed_path) {
            Ok(finalized) => finalized,
            Err(e) => {
                self.restore(&closed_path, &closed_path, created_at);
                return Err(e.into());
            }
        };

        self.rotation_index += 1;
        let next = next_path(&self.template, self.rotation_index);
        match ActiveFile::open(next) {
            Ok(active) => {
                protected.insert(active.path.clone());
                self.active = Some(active);
            }
            Err(e) => {
                self.rotation_index -= 1;
                self.restore(&finalized, &closed_path, created_at);
                return Err(e.into());
            }
        }

        protected.remove(&closed_path);
        if self.transform.is_some() {
            protected.insert(finalized.clone());
        }
        drop(protected);

        self.context.counters.rotations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fennec.logsink.rotations").increment(1);
        info!(
            logsink.event = "file_rotated",
            old_file = %finalized.display(),
            new_file = %self.path().map(|p| p.display().to_string()).unwrap_or_default(),
            rotation_index = self.rotation_index,
            "Log file rotated"
        );

        self.finalize(finalized);
        Ok(())
    }

    /// Terminal transition: close the active file and give it its
    /// compression pass
    pub fn stop(&mut self) -> Result<()> {
        if self.state == SinkState::Stopped {
            return Err(Error::Stopped);
        }

        let active = self.active.take();
        self.state = SinkState::Stopped;

        let mut result = Ok(());
        if let Some(active) = active {
            let files = Arc::clone(&self.context.files);
            let mut protected = files.lock();

            let (flushed, closed_path, _) = active.close();
            if let Err(e) = flushed {
                result = Err(e.into());
            }

            let finalized = if self.transform.is_some() {
                self.route_finalized(&closed_path)
            } else {
                Ok(closed_path.clone())
            };

            protected.remove(&closed_path);
            let finalized = match finalized {
                Ok(finalized) => {
                    if self.transform.is_some() {
                        protected.insert(finalized.clone());
                    }
                    Some(finalized)
                }
                Err(e) => {
                    result = result.and(Err(e.into()));
                    None
                }
            };
            drop(protected);

            if let Some(finalized) = finalized {
                self.finalize(finalized);
            }
        }

        self.shutdown_worker();

        let stats = self.stats();
        info!(
            logsink.event = "sink_stopped",
            template = self.template.raw(),
            bytes_written = stats.bytes_written,
            rotations = stats.rotations,
            compressions = stats.compressions,
            "Log sink stopped"
        );

        result
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SinkState::Stopped => Err(Error::Stopped),
            _ => Ok(()),
        }
    }

    /// The active file, reopened for the current index when a failed
    /// rollback left the sink without one
    fn ensure_active(&mut self) -> Result<&mut ActiveFile> {
        if self.active.is_none() {
            let files = Arc::clone(&self.context.files);
            let mut protected = files.lock();

            let active = ActiveFile::open(next_path(&self.template, self.rotation_index))?;
            protected.insert(active.path.clone());
            warn!(
                logsink.event = "file_reopened",
                file_path = %active.path.display(),
                rotation_index = self.rotation_index,
                "Log sink had no open file, reopened one"
            );
            self.active = Some(active);
        }

        self.active.as_mut().ok_or_else(|| no_active_file().into())
    }

    /// Move a file sitting at a fixed template path aside so the name is
    /// free for the next active file
    fn route_finalized(&self, closed_path: &Path) -> io::Result<PathBuf> {
        if !self.template.is_fixed() || closed_path != self.template.format(0, Utc::now()) {
            return Ok(closed_path.to_path_buf());
        }

        let target = path::unique_variant(closed_path);
        std::fs::rename(closed_path, &target)?;
        Ok(target)
    }

    /// Roll back to the previous file after a failed rotation
    fn restore(&mut self, finalized: &Path, closed_path: &Path, created_at: DateTime<Utc>) {
        if finalized != closed_path {
            if let Err(e) = std::fs::rename(finalized, closed_path) {
                error!(
                    logsink.event = "rotation_rollback_failed",
                    file = %finalized.display(),
                    error = %e,
                    "Failed to move finalized log file back"
                );
            }
        }

        match ActiveFile::open_at(closed_path.to_path_buf(), created_at) {
            Ok(active) => {
                warn!(
                    logsink.event = "rotation_rolled_back",
                    file = %closed_path.display(),
                    "Log rotation failed, continuing on previous file"
                );
                self.active = Some(active);
            }
            Err(e) => {
                error!(
                    logsink.event = "rotation_rollback_failed",
                    file = %closed_path.display(),
                    error = %e,
                    "Failed to reopen previous log file"
                );
            }
        }
    }

    /// Submit the single compression pass for a finalized file, followed by
    /// retention
    fn finalize(&mut self, finalized: PathBuf) {
        let job = self
            .transform
            .clone()
            .map(|transform| CompressionJob::new(finalized, transform));

        match (&self.worker, job) {
            (Some(worker), Some(job)) => {
                if let Err(job) = worker.submit(job) {
                    warn!(
                        logsink.event = "compression_worker_unavailable",
                        "Compression worker is gone, compressing inline"
                    );
                    self.context.run(Some(job));
                }
            }
            (_, job) => self.context.run(job),
        }
    }

    fn shutdown_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.shutdown().is_err() {
                error!(
                    logsink.event = "compression_worker_panicked",
                    "Compression worker panicked"
                );
            }
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if self.state != SinkState::Stopped {
            if let Err(e) = self.stop() {
                warn!(
                    logsink.event = "sink_drop_failed",
                    error = %e,
                    "Failed to stop log sink on drop"
                );
            }
        }
    }
}

/// Concrete path for `rotation_index`, never an existing file when the
/// template lacks `{n}`
fn next_path(template: &PathTemplate, rotation_index: u32) -> PathBuf {
    let path = template.format(rotation_index, Utc::now());
    if !template.has_index() && path.exists() {
        path::unique_variant(&path)
    } else {
        path
    }
}

fn no_active_file() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "no active log file")
}

fn into_io_error(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

thread_local! {
    /// Set while this thread is inside a [`SharedSink`] operation
    static SERVING: Cell<bool> = Cell::new(false);
}

/// Marks the current thread as serving a [`SharedSink`] operation
struct ServingGuard;

impl ServingGuard {
    fn enter() -> Option<Self> {
        SERVING.with(|serving| (!serving.replace(true)).then_some(ServingGuard))
    }

    fn is_serving() -> bool {
        SERVING.with(Cell::get)
    }
}

impl Drop for ServingGuard {
    fn drop(&mut self) {
        SERVING.with(|serving| serving.set(false));
    }
}

/// A [`FileSink`] shared between writers
///
/// Writers are serialized through a mutex. The type implements
/// [`MakeWriter`], so it can back a `tracing-subscriber` fmt layer. Records
/// that reach the sink from inside one of its own operations, such as the
/// events it emits while rotating, are discarded.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<FileSink>>,
}

impl SharedSink {
    pub fn new(sink: FileSink) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn start(config: SinkConfig) -> Result<Self> {
        FileSink::start(config).map(Self::new)
    }

    pub fn write_record(&self, record: &[u8]) -> Result<()> {
        self.with_sink(|sink| sink.write(record))
    }

    pub fn rotate(&self) -> Result<()> {
        self.with_sink(FileSink::rotate)
    }

    pub fn stop(&self) -> Result<()> {
        self.with_sink(FileSink::stop)
    }

    pub fn stats(&self) -> Result<SinkStats> {
        Ok(self.lock()?.stats())
    }

    /// Run `op` with the lock held, refusing calls made from inside another
    /// operation on this thread
    fn with_sink<T>(&self, op: impl FnOnce(&mut FileSink) -> Result<T>) -> Result<T> {
        let _guard = ServingGuard::enter().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                "log sink called from inside one of its own operations",
            )
        })?;
        let mut sink = self.lock()?;
        op(&mut *sink)
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, FileSink>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log sink mutex poisoned"))
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if ServingGuard::is_serving() {
            return Ok(buf.len());
        }
        self.write_record(buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if ServingGuard::is_serving() {
            return Ok(());
        }
        self.with_sink(FileSink::flush).map_err(into_io_error)
    }
}

impl<'a> MakeWriter<'a> for SharedSink {
    type Writer = SharedSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
