//! Session controller
//!
//! Owns the discovered-file queue, the shared stop flag and the single
//! worker task. The collaborator issues start/stop commands here and receives
//! everything else through the event stream.

use crate::event::{Events, RunEvent, RunMode, StopFlag};
use crate::probe::RetryPolicy;
use crate::queue::{run_queue, MediaFile, MediaQueue, RunContext, RunReport};
use crate::scan::{spawn_discovery, DiscoveredFile, ScanError};
use ez_ffmpeg_config::{CacheConfig, ProcessingSpec, ToolsConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// Error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Discovery could not run
    #[error("Discovery failed: {0}")]
    Scan(#[from] ScanError),

    /// A run is already in progress
    #[error("A run is already in progress")]
    AlreadyRunning,

    /// The worker task died
    #[error("Worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Session state
pub struct Session {
    tools: ToolsConfig,
    scratch_dir: PathBuf,
    copy_source: bool,
    output_probe_retry: RetryPolicy,
    queue: MediaQueue,
    events: Events,
    stop: StopFlag,
    worker: Option<JoinHandle<RunReport>>,
}

impl Session {
    /// Create a session using the given tools and scratch settings
    ///
    /// # Arguments
    /// * `tools` - Prober and encoder locations and codecs
    /// * `cache` - Scratch directory configuration
    /// * `events` - Where status and progress events go
    pub fn new(tools: ToolsConfig, cache: &CacheConfig, events: Events) -> Self {
        Self {
            tools,
            scratch_dir: cache.resolved_dir(),
            copy_source: cache.copy_source,
            output_probe_retry: RetryPolicy::default(),
            queue: MediaQueue::new(),
            events,
            stop: StopFlag::new(),
            worker: None,
        }
    }

    /// Override the retry schedule for probing encoded outputs
    pub fn with_output_probe_retry(mut self, policy: RetryPolicy) -> Self {
        self.output_probe_retry = policy;
        self
    }

    /// Start walking `root`, returning the incremental results and the walk handle
    pub fn discover(
        &self,
        root: &Path,
    ) -> Result<
        (
            mpsc::UnboundedReceiver<DiscoveredFile>,
            JoinHandle<Result<usize, ScanError>>,
        ),
        ScanError,
    > {
        spawn_discovery(root, vec![self.scratch_dir.clone()])
    }

    /// Add a discovered file to the queue, emitting `FileDiscovered` if new
    pub fn enqueue(&mut self, file: DiscoveredFile) -> bool {
        match self.queue.push(file) {
            Some(entry) => {
                self.events.emit(RunEvent::FileDiscovered {
                    row: entry.row,
                    path: entry.path.clone(),
                    size_mb: entry.size_mb(),
                });
                true
            }
            None => false,
        }
    }

    /// Discover every video under `root` and queue it
    ///
    /// Files are queued as the walk reports them.
    ///
    /// # Returns
    /// The number of newly queued files
    pub async fn load_folder(&mut self, root: &Path) -> Result<usize, SessionError> {
        info!(root = %root.display(), "loading folder");
        let (mut rx, walk) = self.discover(root)?;

        let mut added = 0;
        while let Some(file) = rx.recv().await {
            if self.enqueue(file) {
                added += 1;
            }
        }
        walk.await??;

        self.events.emit(RunEvent::DiscoveryFinished {
            files: self.queue.len(),
        });
        info!(added, total = self.queue.len(), "discovery finished");
        Ok(added)
    }

    /// Queued files in row order
    pub fn files(&self) -> &[MediaFile] {
        self.queue.files()
    }

    /// Forget every queued file
    pub fn clear(&mut self) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }
        self.queue.clear();
        Ok(())
    }

    /// Whether a worker is active
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Start a run over the current queue
    ///
    /// The spec is a snapshot; later settings changes do not affect this run.
    /// Clears any earlier stop request.
    pub fn start(&mut self, spec: ProcessingSpec, mode: RunMode) -> Result<(), SessionError> {
        if self.is_running() {
            return Err(SessionError::AlreadyRunning);
        }

        self.stop.clear();
        let ctx = Arc::new(RunContext {
            spec,
            tools: self.tools.clone(),
            scratch_dir: self.scratch_dir.clone(),
            copy_source: self.copy_source,
            output_probe_retry: self.output_probe_retry,
            events: self.events.clone(),
            stop: self.stop.clone(),
        });
        let files = self.queue.files().to_vec();
        info!(?mode, files = files.len(), target = spec.target_rate, threshold = spec.threshold, "starting run");
        self.worker = Some(tokio::spawn(run_queue(ctx, files, mode)));
        Ok(())
    }

    /// Request cancellation of the active run
    pub fn stop(&self) {
        info!("stop requested");
        self.stop.request();
    }

    /// Handle on the stop flag, for signal handlers
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Wait for the active run to finish
    ///
    /// # Returns
    /// * `Ok(Some(report))` - The run that just ended
    /// * `Ok(None)` - No run was started
    pub async fn wait(&mut self) -> Result<Option<RunReport>, SessionError> {
        let Some(worker) = self.worker.take() else {
            return Ok(None);
        };
        let report = worker.await?;
        self.queue.absorb(&report.files);
        Ok(Some(report))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::event::{RunOutcome, Status};
    use crate::test_support::{fake_video, FakeEncode, FakeTools};
    use ez_ffmpeg_config::Settings;
    use std::time::Duration;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    struct Fixture {
        _temp_dir: TempDir,
        library: PathBuf,
        scratch: PathBuf,
        session: Session,
        rx: mpsc::UnboundedReceiver<RunEvent>,
    }

    fn fixture(encode: FakeEncode) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let tools = FakeTools::with_encoder(temp_dir.path(), encode);
        let library = temp_dir.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        let scratch = temp_dir.path().join("scratch");
        let cache = CacheConfig {
            dir: Some(scratch.clone()),
            copy_source: false,
        };
        let (events, rx) = Events::channel();
        let session = Session::new(tools.tools_config(), &cache, events)
            .with_output_probe_retry(RetryPolicy::immediate(2));
        Fixture {
            _temp_dir: temp_dir,
            library,
            scratch,
            session,
            rx,
        }
    }

    fn spec() -> ProcessingSpec {
        ProcessingSpec::from_settings(&Settings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_load_folder_queues_each_file_once() {
        let mut f = fixture(FakeEncode::default());
        fake_video(&f.library.join("a.mkv"), 1, 60.0);
        fake_video(&f.library.join("b.mp4"), 2, 60.0);
        std::fs::write(f.library.join("readme.txt"), b"hi").unwrap();

        assert_eq!(f.session.load_folder(&f.library).await.unwrap(), 2);
        assert_eq!(f.session.load_folder(&f.library).await.unwrap(), 0);
        assert_eq!(f.session.files().len(), 2);

        let mut discovered = Vec::new();
        while let Ok(event) = f.rx.try_recv() {
            if let RunEvent::FileDiscovered { row, path, size_mb } = event {
                discovered.push((row, path.file_name().unwrap().to_owned(), size_mb));
            }
        }
        assert_eq!(
            discovered,
            vec![(0, "a.mkv".into(), 1.0), (1, "b.mp4".into(), 2.0)]
        );
    }

    #[tokio::test]
    async fn test_load_folder_ignores_scratch_directory_inside_library() {
        let temp_dir = TempDir::new().unwrap();
        let tools = FakeTools::install(temp_dir.path());
        let library = temp_dir.path().join("library");
        let scratch = library.join(".cache");
        fake_video(&library.join("film.mkv"), 1, 60.0);
        fake_video(&scratch.join("film.0123456789abcdef_processed.mkv"), 1, 60.0);
        let cache = CacheConfig {
            dir: Some(scratch),
            copy_source: true,
        };
        let mut session = Session::new(tools.tools_config(), &cache, Events::disabled());

        assert_eq!(session.load_folder(&library).await.unwrap(), 1);
        assert_eq!(session.files()[0].path, library.join("film.mkv"));
    }

    #[tokio::test]
    async fn test_load_folder_missing_root() {
        let mut f = fixture(FakeEncode::default());
        let result = f.session.load_folder(&f.library.join("nope")).await;
        assert!(matches!(result, Err(SessionError::Scan(ScanError::RootNotFound(_)))));
    }

    #[tokio::test]
    async fn test_run_updates_queue_statuses() {
        let mut f = fixture(FakeEncode {
            output_bytes: Some(30 * MB),
            output_duration: 180.0,
            ..FakeEncode::default()
        });
        fake_video(&f.library.join("big.mkv"), 90, 180.0);
        fake_video(&f.library.join("small.mkv"), 10, 180.0);
        f.session.load_folder(&f.library).await.unwrap();

        f.session.start(spec(), RunMode::Process).unwrap();
        let report = f.session.wait().await.unwrap().unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.summary.completed, 1);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(f.session.files()[0].status, Status::Completed);
        assert_eq!(f.session.files()[1].status, Status::Skipped);
        assert_eq!(f.session.files()[1].duration_secs, Some(180.0));
        assert!(!f.session.is_running());
        assert!(f.session.wait().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let mut f = fixture(FakeEncode {
            hang: true,
            ..FakeEncode::default()
        });
        fake_video(&f.library.join("big.mkv"), 90, 180.0);
        f.session.load_folder(&f.library).await.unwrap();

        f.session.start(spec(), RunMode::Process).unwrap();
        assert!(matches!(
            f.session.start(spec(), RunMode::Estimate),
            Err(SessionError::AlreadyRunning)
        ));

        f.session.stop();
        let report = tokio::time::timeout(Duration::from_secs(10), f.session.wait())
            .await
            .expect("stop should end the run promptly")
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_mid_queue_cancels_run() {
        let mut f = fixture(FakeEncode {
            hang: true,
            ..FakeEncode::default()
        });
        fake_video(&f.library.join("first.mkv"), 90, 180.0);
        fake_video(&f.library.join("second.mkv"), 60, 180.0);
        f.session.load_folder(&f.library).await.unwrap();

        f.session.start(spec(), RunMode::Process).unwrap();

        // Wait until the first encode is reporting progress, then stop
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), f.rx.recv())
                .await
                .expect("encode should report progress")
                .expect("event stream open");
            let progressed = matches!(event, RunEvent::Progress { .. });
            seen.push(event);
            if progressed {
                break;
            }
        }
        f.session.stop();

        let report = tokio::time::timeout(Duration::from_secs(10), f.session.wait())
            .await
            .expect("stop should end the run promptly")
            .unwrap()
            .unwrap();
        while let Ok(event) = f.rx.try_recv() {
            seen.push(event);
        }

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.summary.cancelled, 1);
        let processing: Vec<usize> = seen
            .iter()
            .filter_map(|e| match e {
                RunEvent::Status { row, status: Status::Processing } => Some(*row),
                _ => None,
            })
            .collect();
        assert_eq!(processing, vec![0]);
        assert_eq!(f.session.files()[0].status, Status::Cancelled);
        assert_eq!(f.session.files()[1].status, Status::Queued);
        assert!(!crate::encode::output_path_for(&f.library.join("first.mkv"), &f.scratch).exists());
        assert_eq!(std::fs::metadata(f.library.join("first.mkv")).unwrap().len(), 90 * MB);
        assert!(matches!(
            seen.last(),
            Some(RunEvent::RunFinished { outcome: RunOutcome::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn test_start_clears_previous_stop() {
        let mut f = fixture(FakeEncode::default());
        fake_video(&f.library.join("small.mkv"), 10, 180.0);
        f.session.load_folder(&f.library).await.unwrap();

        f.session.stop();
        f.session.start(spec(), RunMode::Estimate).unwrap();
        let report = f.session.wait().await.unwrap().unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.summary.estimated, 1);
    }
}
