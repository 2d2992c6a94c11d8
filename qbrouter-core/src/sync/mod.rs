//! Event-driven mirroring of the hot tree into the cold tree.
//!
//! Three activities share one task: the initial full mirror, the watcher feeding a bounded
//! queue, and the batch processor draining it. The processor waits on a gate that the initial
//! mirror opens, so no incremental pass ever races the full one; events observed meanwhile are
//! simply processed afterwards.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::fs_watch::{ChangeEvent, ChangeKind, RecursiveWatcher, WatchConfig};

mod mirror;

pub use mirror::{DEFAULT_RSYNC_FLAGS, Mirror, RsyncMirror};

const TARGET: &str = "qbrouter::sync";

/// Settings for [`SyncEngine`].
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Hot tree being watched.
    pub source: PathBuf,
    /// Cold tree receiving the mirror.
    pub destination: PathBuf,
    /// Upper bound on how long a batch keeps accumulating after its first event.
    pub batch_window: Duration,
    /// A batch closes early when no event arrives within this long.
    pub poll_timeout: Duration,
    /// Capacity of the event queue between the watcher and the batch processor.
    pub queue_capacity: usize,
    /// Log intended mirror runs without performing them.
    pub dry_run: bool,
    pub watch: WatchConfig,
}

impl SyncConfig {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            batch_window: Duration::from_secs(15),
            poll_timeout: Duration::from_secs(5),
            queue_capacity: 4096,
            dry_run: false,
            watch: WatchConfig::default(),
        }
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    mirror: Arc<dyn Mirror>,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(config: SyncConfig, mirror: Arc<dyn Mirror>) -> Self {
        Self { config, mirror }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Watch the source tree and keep the destination mirrored until `cancel` fires.
    ///
    /// Only a failure to start watching is returned; mirror failures are logged and retried.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let events = RecursiveWatcher::new(&self.config.source, self.config.watch)?
            .start(cancel.clone())
            .await?;
        self.run_with_events(events, cancel).await;
        Ok(())
    }

    /// Drive the engine from an arbitrary event stream.
    ///
    /// Returns once `cancel` fired (or the stream ended) and every queued event was processed.
    pub async fn run_with_events<S>(&self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = ChangeEvent> + Unpin,
    {
        info!(
            target: TARGET,
            source = %self.config.source.display(),
            destination = %self.config.destination.display(),
            "starting sync engine"
        );

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (gate_tx, gate_rx) = watch::channel(false);
        let owes_full = AtomicBool::new(false);

        tokio::join!(
            self.initial_sync(gate_tx, &owes_full),
            self.process_events(rx, gate_rx, &owes_full),
            watch_and_queue(events, tx, &cancel),
        );

        info!(target: TARGET, "sync engine stopped");
    }

    async fn initial_sync(&self, gate: watch::Sender<bool>, owes_full: &AtomicBool) {
        info!(target: TARGET, "starting initial sync");
        match self.mirror_pass("initial sync", None).await {
            Ok(()) => info!(target: TARGET, "initial sync completed"),
            Err(err) => {
                error!(target: TARGET, error = %err, "initial sync failed, next batch runs a full pass");
                owes_full.store(true, Ordering::Release);
            }
        }
        gate.send_replace(true);
    }

    async fn process_events(
        &self,
        mut rx: mpsc::Receiver<ChangeEvent>,
        mut gate: watch::Receiver<bool>,
        owes_full: &AtomicBool,
    ) {
        if gate.wait_for(|open| *open).await.is_err() {
            return;
        }

        while let Some(batch) = next_batch(&mut rx, self.config.batch_window, self.config.poll_timeout).await {
            self.process_batch(batch, owes_full).await;
        }
    }

    async fn process_batch(&self, batch: Vec<ChangeEvent>, owes_full: &AtomicBool) {
        for event in &batch {
            debug!(target: TARGET, path = %event.path.display(), kind = ?event.kind, "file event");
        }

        let overflowed = batch.iter().any(|event| event.kind == ChangeKind::Overflow);
        if overflowed || owes_full.load(Ordering::Acquire) {
            let reason = if overflowed { "event overflow" } else { "retry full sync" };
            match self.mirror_pass(reason, None).await {
                Ok(()) => owes_full.store(false, Ordering::Release),
                Err(err) => {
                    error!(target: TARGET, error = %err, "full sync failed");
                    owes_full.store(true, Ordering::Release);
                }
            }
            return;
        }

        let events = batch.len();
        let files = changed_files(&self.config.source, batch).await;
        if files.is_empty() {
            info!(target: TARGET, events, "no files to sync, skipping mirror");
            return;
        }

        match self.mirror_pass("file changes", Some(&files)).await {
            Ok(()) => info!(target: TARGET, events, files = files.len(), "processed file events"),
            Err(err) => error!(target: TARGET, error = %err, files = files.len(), "mirror failed"),
        }
    }

    /// One mirror run. The log line is identical in dry-run and live mode apart from the field.
    async fn mirror_pass(&self, reason: &str, files: Option<&[PathBuf]>) -> Result<()> {
        let dry_run = self.config.dry_run;
        info!(
            target: TARGET,
            dry_run,
            reason,
            files = files.map(<[PathBuf]>::len),
            "mirroring {} to {}",
            self.config.source.display(),
            self.config.destination.display()
        );
        if let Some(files) = files {
            for file in files {
                debug!(target: TARGET, dry_run, file = %file.display(), "queued for mirror");
            }
        }

        if dry_run {
            return Ok(());
        }
        self.mirror
            .replicate(&self.config.source, &self.config.destination, files)
            .await
    }
}

async fn watch_and_queue<S>(mut events: S, tx: mpsc::Sender<ChangeEvent>, cancel: &CancellationToken)
where
    S: Stream<Item = ChangeEvent> + Unpin,
{
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else {
            if !cancel.is_cancelled() {
                warn!(target: TARGET, "watch stream ended");
            }
            break;
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    // Dropping `tx` lets the batch processor drain the queue and exit.
}

/// Wait for the first event, then keep collecting until the window elapses or the queue stays
/// quiet for `poll_timeout`. `None` once the queue is closed and empty.
async fn next_batch(
    rx: &mut mpsc::Receiver<ChangeEvent>,
    window: Duration,
    poll_timeout: Duration,
) -> Option<Vec<ChangeEvent>> {
    let first = rx.recv().await?;
    let deadline = Instant::now() + window;
    let mut batch = vec![first];

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match timeout(poll_timeout.min(deadline - now), rx.recv()).await {
            Ok(Some(event)) => batch.push(event),
            Ok(None) | Err(_) => break,
        }
    }
    Some(batch)
}

/// Deduplicate batch paths into regular files that still exist, relative to `source`.
async fn changed_files(source: &Path, batch: Vec<ChangeEvent>) -> Vec<PathBuf> {
    let unique: BTreeSet<PathBuf> = batch.into_iter().map(|event| event.path).collect();

    let mut files = Vec::with_capacity(unique.len());
    for path in unique {
        match tokio::fs::metadata(&path).await {
            Ok(meta) if !meta.is_dir() => {}
            _ => continue,
        }
        match path.strip_prefix(source) {
            Ok(relative) if !relative.as_os_str().is_empty() => files.push(relative.to_path_buf()),
            _ => debug!(target: TARGET, path = %path.display(), "event outside source tree"),
        }
    }
    files
}
