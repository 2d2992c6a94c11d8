//! Recursive filesystem watcher.
//!
//! The underlying notification primitive only watches single directories, so the watcher keeps
//! its own set of watched directories and extends it as directories appear. Every directory that
//! exists under the root when [`RecursiveWatcher::start`] is called is watched before the stream
//! yields anything; a directory created (or moved in) later has its whole subtree watched, in
//! pre-order, before the watcher processes the next notification.
//!
//! Known limitations, accepted rather than solved:
//! - notifications for a watched directory that was moved entirely outside the tree are still
//!   delivered until its move-out notification is processed;
//! - a directory moved within the tree may briefly yield paths under its old location.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use notify::Event;
use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, RouterError};

mod backend;

pub use backend::{NotifyBackend, WatchBackend, WatchMessage};

const TARGET: &str = "qbrouter::watch";

/// What happened to a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    MovedIn,
    MovedOut,
    /// A watched directory was deleted. Consumed internally.
    DirectoryRemoved,
    /// The backend dropped a watch. Consumed internally.
    WatchRemoved,
    /// Notifications were lost; the consumer should treat the whole tree as changed.
    Overflow,
}

impl ChangeKind {
    /// Whether events of this kind are yielded to the consumer.
    pub fn is_subscribed(self) -> bool {
        matches!(
            self,
            ChangeKind::Created | ChangeKind::MovedIn | ChangeKind::MovedOut | ChangeKind::Overflow
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_dir: bool,
}

impl ChangeEvent {
    fn new(path: PathBuf, kind: ChangeKind, is_dir: bool) -> Self {
        Self { path, kind, is_dir }
    }
}

/// Stream of subscribed change events. Ends when the watcher is cancelled.
pub type ChangeStream = ReceiverStream<ChangeEvent>;

/// Channel sizes for the watcher.
#[derive(Clone, Copy, Debug)]
pub struct WatchConfig {
    /// Raw notifications buffered between the backend thread and the watcher task. When full,
    /// notifications are dropped and an [`ChangeKind::Overflow`] event is yielded instead.
    pub raw_capacity: usize,
    /// Change events buffered between the watcher task and the consumer.
    pub event_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            raw_capacity: 8192,
            event_capacity: 1024,
        }
    }
}

/// Watches `root` and every directory below it, including ones created later.
pub struct RecursiveWatcher<B> {
    root: PathBuf,
    backend: B,
    raw_rx: mpsc::Receiver<WatchMessage>,
    watched: BTreeSet<PathBuf>,
    event_capacity: usize,
}

impl<B> fmt::Debug for RecursiveWatcher<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveWatcher")
            .field("root", &self.root)
            .field("watched", &self.watched.len())
            .finish()
    }
}

impl RecursiveWatcher<NotifyBackend> {
    pub fn new(root: impl Into<PathBuf>, config: WatchConfig) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::channel(config.raw_capacity.max(1));
        let backend = NotifyBackend::new(raw_tx)?;
        Ok(Self::with_backend(
            root,
            backend,
            raw_rx,
            config.event_capacity,
        ))
    }
}

impl<B: WatchBackend> RecursiveWatcher<B> {
    /// Build a watcher over an arbitrary backend. `raw_rx` must receive whatever the backend
    /// reports for the directories it is asked to watch.
    pub fn with_backend(
        root: impl Into<PathBuf>,
        backend: B,
        raw_rx: mpsc::Receiver<WatchMessage>,
        event_capacity: usize,
    ) -> Self {
        Self {
            root: root.into(),
            backend,
            raw_rx,
            watched: BTreeSet::new(),
            event_capacity: event_capacity.max(1),
        }
    }

    /// Install watches on the existing tree, then hand the watcher to a background task.
    ///
    /// Fails if the root is not a directory or cannot be watched.
    pub async fn start(mut self, cancel: CancellationToken) -> Result<ChangeStream> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|err| RouterError::Watch {
                path: self.root.clone(),
                reason: err.to_string(),
            })?;
        if !meta.is_dir() {
            return Err(RouterError::Watch {
                path: self.root.clone(),
                reason: "not a directory".into(),
            });
        }

        self.backend.watch(&self.root)?;
        self.watched.insert(self.root.clone());
        let root = self.root.clone();
        self.install_children(&root, None).await;
        info!(
            target: TARGET,
            root = %self.root.display(),
            directories = self.watched.len(),
            "watching tree"
        );

        let (tx, rx) = mpsc::channel(self.event_capacity);
        tokio::spawn(async move { self.run(tx, cancel).await });
        Ok(ReceiverStream::new(rx))
    }

    async fn run(mut self, tx: mpsc::Sender<ChangeEvent>, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.raw_rx.recv() => message,
            };

            let mut events = match message {
                Some(WatchMessage::Event(event)) => self.handle(event).await,
                Some(WatchMessage::Error(reason)) => {
                    warn!(target: TARGET, %reason, "watch backend error");
                    vec![self.overflow()]
                }
                None => break,
            };

            // Checked after every message: drops only happen while the queue is non-empty.
            if self.backend.take_overflow() {
                warn!(target: TARGET, "notification queue overflowed");
                events.push(self.overflow());
            }

            for event in events {
                if tx.send(event).await.is_err() {
                    debug!(target: TARGET, "consumer gone, stopping watcher");
                    return;
                }
            }
        }
        debug!(target: TARGET, root = %self.root.display(), "watcher stopped");
    }

    fn overflow(&self) -> ChangeEvent {
        ChangeEvent::new(self.root.clone(), ChangeKind::Overflow, true)
    }

    /// Turn one raw notification into the events to yield, updating watches on the way.
    async fn handle(&mut self, event: Event) -> Vec<ChangeEvent> {
        if event.need_rescan() {
            return vec![self.overflow()];
        }

        let mut out = Vec::new();
        for (path, raw) in classify(&event) {
            let kind = match raw {
                RawKind::Known(kind) => kind,
                RawKind::RenameUnknown => {
                    if tokio::fs::symlink_metadata(&path).await.is_ok() {
                        ChangeKind::MovedIn
                    } else {
                        ChangeKind::MovedOut
                    }
                }
                RawKind::Ignored => {
                    debug!(target: TARGET, path = %path.display(), kind = ?event.kind, "unyielded event");
                    continue;
                }
            };

            if !kind.is_subscribed() {
                self.forget_tree(&path);
                debug!(target: TARGET, path = %path.display(), ?kind, "unyielded event");
                continue;
            }

            match kind {
                ChangeKind::Created | ChangeKind::MovedIn => {
                    let is_dir = tokio::fs::symlink_metadata(&path)
                        .await
                        .map(|meta| meta.is_dir())
                        .unwrap_or(false);
                    if is_dir {
                        let mut seeded = Vec::new();
                        self.install_tree(&path, &mut seeded).await;
                        out.push(ChangeEvent::new(path, kind, true));
                        out.extend(seeded);
                    } else {
                        out.push(ChangeEvent::new(path, kind, false));
                    }
                }
                ChangeKind::MovedOut => {
                    let was_dir = self.watched.contains(&path);
                    self.forget_tree(&path);
                    out.push(ChangeEvent::new(path, kind, was_dir));
                }
                ChangeKind::Overflow => out.push(self.overflow()),
                ChangeKind::DirectoryRemoved | ChangeKind::WatchRemoved => {}
            }
        }
        out
    }

    /// Watch `top` and every directory below it. Files found along the way are reported as
    /// synthetic `Created` events, since they may have been written before the watch landed.
    async fn install_tree(&mut self, top: &Path, seeded: &mut Vec<ChangeEvent>) {
        if self.watched.contains(top) {
            return;
        }
        if let Err(err) = self.backend.watch(top) {
            warn!(target: TARGET, path = %top.display(), error = %err, "failed to watch directory");
            return;
        }
        self.watched.insert(top.to_path_buf());
        debug!(target: TARGET, path = %top.display(), "add watching");
        self.install_children(top, Some(seeded)).await;
    }

    /// Pre-order install below an already watched directory, using an explicit worklist.
    async fn install_children(&mut self, top: &Path, mut seeded: Option<&mut Vec<ChangeEvent>>) {
        let mut stack = vec![top.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    debug!(target: TARGET, path = %dir.display(), error = %err, "cannot list directory");
                    continue;
                }
            };

            let mut children = Vec::new();
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    children.push(entry.path());
                } else if file_type.is_file()
                    && let Some(seeded) = seeded.as_deref_mut()
                {
                    seeded.push(ChangeEvent::new(entry.path(), ChangeKind::Created, false));
                }
            }
            children.sort();

            // Watch each child before descending into any of them.
            let mut next = Vec::with_capacity(children.len());
            for child in children {
                if self.watched.contains(&child) {
                    continue;
                }
                match self.backend.watch(&child) {
                    Ok(()) => {
                        debug!(target: TARGET, path = %child.display(), "watching");
                        self.watched.insert(child.clone());
                        next.push(child);
                    }
                    Err(err) => {
                        warn!(target: TARGET, path = %child.display(), error = %err, "failed to watch directory");
                    }
                }
            }
            stack.extend(next.into_iter().rev());
        }
    }

    fn forget_tree(&mut self, top: &Path) {
        let doomed: Vec<PathBuf> = self
            .watched
            .range(top.to_path_buf()..)
            .take_while(|path| path.starts_with(top))
            .cloned()
            .collect();

        for dir in doomed {
            if let Err(err) = self.backend.unwatch(&dir) {
                debug!(target: TARGET, path = %dir.display(), error = %err, "unwatch failed");
            }
            self.watched.remove(&dir);
        }
    }
}

/// Watch `root` with the platform backend and default channel sizes.
pub async fn watch_tree(root: impl Into<PathBuf>, cancel: CancellationToken) -> Result<ChangeStream> {
    RecursiveWatcher::new(root, WatchConfig::default())?
        .start(cancel)
        .await
}

enum RawKind {
    Known(ChangeKind),
    /// A rename whose direction the backend did not report.
    RenameUnknown,
    Ignored,
}

fn classify(event: &Event) -> Vec<(PathBuf, RawKind)> {
    let each = |kind: ChangeKind| -> Vec<(PathBuf, RawKind)> {
        event
            .paths
            .iter()
            .map(|path| (path.clone(), RawKind::Known(kind)))
            .collect()
    };

    match &event.kind {
        EventKind::Create(CreateKind::Other) => Vec::new(),
        EventKind::Create(_) => each(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(ChangeKind::MovedIn),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(ChangeKind::MovedOut),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                out.push((from.clone(), RawKind::Known(ChangeKind::MovedOut)));
            }
            if let Some(to) = event.paths.get(1) {
                out.push((to.clone(), RawKind::Known(ChangeKind::MovedIn)));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|path| (path.clone(), RawKind::RenameUnknown))
            .collect(),
        EventKind::Remove(RemoveKind::Folder) => each(ChangeKind::DirectoryRemoved),
        EventKind::Remove(_) => each(ChangeKind::WatchRemoved),
        _ => event
            .paths
            .iter()
            .map(|path| (path.clone(), RawKind::Ignored))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::StreamExt;
    use notify::event::{AccessKind, DataChange, Flag};

    use super::*;

    #[derive(Clone, Default)]
    struct RecordingBackend {
        calls: Arc<Mutex<Vec<(&'static str, PathBuf)>>>,
    }

    impl RecordingBackend {
        fn watched_in_order(&self) -> Vec<PathBuf> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(op, _)| *op == "watch")
                .map(|(_, path)| path.clone())
                .collect()
        }

        fn unwatched(&self) -> Vec<PathBuf> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(op, _)| *op == "unwatch")
                .map(|(_, path)| path.clone())
                .collect()
        }
    }

    impl WatchBackend for RecordingBackend {
        fn watch(&mut self, dir: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(("watch", dir.to_path_buf()));
            Ok(())
        }

        fn unwatch(&mut self, dir: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(("unwatch", dir.to_path_buf()));
            Ok(())
        }
    }

    async fn start_fake(
        root: &Path,
    ) -> (RecordingBackend, mpsc::Sender<WatchMessage>, ChangeStream, CancellationToken) {
        let backend = RecordingBackend::default();
        let (raw_tx, raw_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let stream = RecursiveWatcher::with_backend(root, backend.clone(), raw_rx, 64)
            .start(cancel.clone())
            .await
            .expect("watcher starts");
        (backend, raw_tx, stream, cancel)
    }

    async fn next(stream: &mut ChangeStream) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event within timeout")
            .expect("stream open")
    }

    #[tokio::test]
    async fn existing_tree_is_watched_in_pre_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["b/inner", "a/x/deep", "a/y"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        std::fs::write(root.join("a/file.bin"), b"data").unwrap();

        let (backend, _raw_tx, _stream, cancel) = start_fake(root).await;
        let watched = backend.watched_in_order();
        cancel.cancel();

        assert_eq!(watched.len(), 7);
        assert_eq!(watched[0], root);
        for (idx, path) in watched.iter().enumerate() {
            if let Some(parent) = path.parent().filter(|_| path != root) {
                let parent_idx = watched.iter().position(|p| p == parent).unwrap();
                assert!(parent_idx < idx, "{parent:?} must be watched before {path:?}");
            }
        }
    }

    #[tokio::test]
    async fn missing_root_is_a_watch_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_raw_tx, raw_rx) = mpsc::channel(1);
        let err = RecursiveWatcher::with_backend(
            dir.path().join("absent"),
            RecordingBackend::default(),
            raw_rx,
            1,
        )
        .start(CancellationToken::new())
        .await
        .expect_err("root does not exist");
        assert!(matches!(err, RouterError::Watch { .. }));
    }

    #[tokio::test]
    async fn new_directory_subtree_is_watched_and_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (backend, raw_tx, mut stream, cancel) = start_fake(&root).await;

        let new_dir = root.join("Show.S01");
        std::fs::create_dir_all(new_dir.join("extras")).unwrap();
        std::fs::write(new_dir.join("extras/sample.mkv"), b"x").unwrap();

        raw_tx
            .send(WatchMessage::Event(
                Event::new(EventKind::Create(CreateKind::Folder)).add_path(new_dir.clone()),
            ))
            .await
            .unwrap();

        let first = next(&mut stream).await;
        assert_eq!(first, ChangeEvent::new(new_dir.clone(), ChangeKind::Created, true));
        let seeded = next(&mut stream).await;
        assert_eq!(
            seeded,
            ChangeEvent::new(new_dir.join("extras/sample.mkv"), ChangeKind::Created, false)
        );

        let watched = backend.watched_in_order();
        assert!(watched.contains(&new_dir));
        assert!(watched.contains(&new_dir.join("extras")));
        cancel.cancel();
    }

    #[test]
    fn removal_kinds_are_consumed_internally() {
        assert!(ChangeKind::Created.is_subscribed());
        assert!(ChangeKind::MovedOut.is_subscribed());
        assert!(ChangeKind::Overflow.is_subscribed());
        assert!(!ChangeKind::DirectoryRemoved.is_subscribed());
        assert!(!ChangeKind::WatchRemoved.is_subscribed());
    }

    #[tokio::test]
    async fn unsubscribed_events_are_not_yielded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir(root.join("gone")).unwrap();
        let (backend, raw_tx, mut stream, cancel) = start_fake(&root).await;

        let file = root.join("movie.mkv");
        std::fs::write(&file, b"x").unwrap();

        for event in [
            Event::new(EventKind::Access(AccessKind::Read)).add_path(file.clone()),
            Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path(file.clone()),
            Event::new(EventKind::Remove(RemoveKind::Folder)).add_path(root.join("gone")),
            Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone()),
        ] {
            raw_tx.send(WatchMessage::Event(event)).await.unwrap();
        }

        let event = next(&mut stream).await;
        assert_eq!(event, ChangeEvent::new(file, ChangeKind::Created, false));
        assert_eq!(backend.unwatched(), vec![root.join("gone")]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn moving_a_directory_out_drops_its_watches() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("old/nested")).unwrap();
        let (backend, raw_tx, mut stream, cancel) = start_fake(&root).await;

        raw_tx
            .send(WatchMessage::Event(
                Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
                    .add_path(root.join("old")),
            ))
            .await
            .unwrap();

        let event = next(&mut stream).await;
        assert_eq!(event.kind, ChangeKind::MovedOut);
        assert!(event.is_dir);
        assert_eq!(
            backend.unwatched(),
            vec![root.join("old"), root.join("old/nested")]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn rescan_flag_and_backend_errors_become_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let (_backend, raw_tx, mut stream, cancel) = start_fake(&root).await;

        raw_tx
            .send(WatchMessage::Event(
                Event::new(EventKind::Other).set_flag(Flag::Rescan),
            ))
            .await
            .unwrap();
        raw_tx
            .send(WatchMessage::Error("queue overflow".into()))
            .await
            .unwrap();

        for _ in 0..2 {
            let event = next(&mut stream).await;
            assert_eq!(event.kind, ChangeKind::Overflow);
            assert_eq!(event.path, root);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (_backend, _raw_tx, mut stream, cancel) = start_fake(dir.path()).await;
        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream ends promptly");
        assert!(end.is_none());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn notify_backend_reports_files_in_new_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let cancel = CancellationToken::new();
        let mut stream = watch_tree(&root, cancel.clone()).await.expect("watch starts");

        let season = root.join("season");
        std::fs::create_dir(&season).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let episode = season.join("e01.mkv");
        std::fs::write(&episode, b"frames").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut seen = false;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(event)) if event.path == episode => {
                    seen = true;
                    break;
                }
                Ok(Some(_)) | Err(_) => continue,
                Ok(None) => break,
            }
        }
        cancel.cancel();
        assert!(seen, "file created in a new directory must be reported");
    }
}
