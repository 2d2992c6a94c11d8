use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::{Result, RouterError};

/// Raw notification forwarded from the backend thread into the watcher task.
pub enum WatchMessage {
    Event(Event),
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

/// Per-directory watch installation. Implementations deliver notifications for every watched
/// directory (non-recursively) into the channel they were built with.
pub trait WatchBackend: Send + 'static {
    fn watch(&mut self, dir: &Path) -> Result<()>;
    fn unwatch(&mut self, dir: &Path) -> Result<()>;

    /// Set when notifications were dropped because the consumer fell behind. Reading clears it.
    fn take_overflow(&self) -> bool {
        false
    }
}

/// [`WatchBackend`] over the platform's recommended `notify` watcher (inotify on Linux).
pub struct NotifyBackend {
    inner: RecommendedWatcher,
    overflowed: Arc<AtomicBool>,
}

impl fmt::Debug for NotifyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyBackend")
            .field("overflowed", &self.overflowed.load(Ordering::Relaxed))
            .finish()
    }
}

impl NotifyBackend {
    pub fn new(tx: mpsc::Sender<WatchMessage>) -> Result<Self> {
        let overflowed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&overflowed);

        // Never block the notify thread: `watch()` round-trips through it, so a blocking send
        // while the watcher task is installing watches would deadlock.
        let inner = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let msg = match res {
                    Ok(event) => WatchMessage::Event(event),
                    Err(err) => WatchMessage::Error(err.to_string()),
                };
                match tx.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => flag.store(true, Ordering::Release),
                    Err(TrySendError::Closed(_)) => {}
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|err| RouterError::Watch {
            path: Default::default(),
            reason: format!("failed to create watcher: {err}"),
        })?;

        Ok(Self { inner, overflowed })
    }
}

impl WatchBackend for NotifyBackend {
    fn watch(&mut self, dir: &Path) -> Result<()> {
        self.inner
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|err| RouterError::Watch {
                path: dir.to_path_buf(),
                reason: err.to_string(),
            })
    }

    fn unwatch(&mut self, dir: &Path) -> Result<()> {
        self.inner.unwatch(dir).map_err(|err| RouterError::Watch {
            path: dir.to_path_buf(),
            reason: err.to_string(),
        })
    }

    fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::AcqRel)
    }
}
