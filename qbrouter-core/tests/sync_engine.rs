use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use qbrouter_core::error::{Result, RouterError};
use qbrouter_core::fs_watch::{ChangeEvent, ChangeKind};
use qbrouter_core::sync::{Mirror, RsyncMirror, SyncConfig, SyncEngine};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Records every mirror run: `None` for a full pass, the file list otherwise.
#[derive(Default)]
struct RecordingMirror {
    runs: Mutex<Vec<Option<Vec<PathBuf>>>>,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingMirror {
    fn failing_first(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn runs(&self) -> Vec<Option<Vec<PathBuf>>> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mirror for RecordingMirror {
    async fn replicate(&self, _source: &Path, _dest: &Path, files: Option<&[PathBuf]>) -> Result<()> {
        self.runs.lock().unwrap().push(files.map(<[PathBuf]>::to_vec));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RouterError::Subprocess {
                program: "rsync".into(),
                code: Some(12),
            });
        }
        Ok(())
    }
}

struct Trees {
    _dir: TempDir,
    hot: PathBuf,
    cold: PathBuf,
}

fn trees() -> Trees {
    let dir = tempfile::tempdir().unwrap();
    let hot = dir.path().join("hot");
    let cold = dir.path().join("cold");
    fs::create_dir_all(hot.join("season")).unwrap();
    fs::create_dir_all(&cold).unwrap();
    fs::write(hot.join("movie.mkv"), b"movie").unwrap();
    fs::write(hot.join("season/e01.mkv"), b"e01").unwrap();
    Trees {
        _dir: dir,
        hot,
        cold,
    }
}

fn config(trees: &Trees) -> SyncConfig {
    let mut config = SyncConfig::new(&trees.hot, &trees.cold);
    config.batch_window = Duration::from_millis(300);
    config.poll_timeout = Duration::from_millis(50);
    config
}

fn created(path: PathBuf) -> ChangeEvent {
    ChangeEvent {
        path,
        kind: ChangeKind::Created,
        is_dir: false,
    }
}

async fn run_to_end(engine: &SyncEngine, events: Vec<ChangeEvent>) {
    tokio::time::timeout(
        Duration::from_secs(5),
        engine.run_with_events(stream::iter(events), CancellationToken::new()),
    )
    .await
    .expect("engine drains a finite stream and returns");
}

#[tokio::test]
async fn initial_full_pass_precedes_file_list_pass() {
    let trees = trees();
    let mirror = Arc::new(RecordingMirror::default());
    let engine = SyncEngine::new(config(&trees), mirror.clone());

    run_to_end(
        &engine,
        vec![
            created(trees.hot.join("season/e01.mkv")),
            created(trees.hot.join("movie.mkv")),
            created(trees.hot.join("season/e01.mkv")),
            created(trees.hot.join("season")),
            created(trees.hot.join("gone.part")),
        ],
    )
    .await;

    assert_eq!(
        mirror.runs(),
        vec![
            None,
            Some(vec![PathBuf::from("movie.mkv"), PathBuf::from("season/e01.mkv")]),
        ]
    );
}

#[tokio::test]
async fn batch_without_existing_files_skips_mirror() {
    let trees = trees();
    let mirror = Arc::new(RecordingMirror::default());
    let engine = SyncEngine::new(config(&trees), mirror.clone());

    run_to_end(
        &engine,
        vec![
            created(trees.hot.join("season")),
            created(trees.hot.join("deleted.tmp")),
        ],
    )
    .await;

    assert_eq!(mirror.runs(), vec![None]);
}

#[tokio::test]
async fn overflow_forces_full_pass() {
    let trees = trees();
    let mirror = Arc::new(RecordingMirror::default());
    let engine = SyncEngine::new(config(&trees), mirror.clone());

    run_to_end(
        &engine,
        vec![
            created(trees.hot.join("movie.mkv")),
            ChangeEvent {
                path: trees.hot.clone(),
                kind: ChangeKind::Overflow,
                is_dir: true,
            },
        ],
    )
    .await;

    assert_eq!(mirror.runs(), vec![None, None]);
}

#[tokio::test]
async fn failed_initial_sync_is_retried_in_full() {
    let trees = trees();
    let mirror = Arc::new(RecordingMirror::failing_first(1));
    let engine = SyncEngine::new(config(&trees), mirror.clone());

    run_to_end(&engine, vec![created(trees.hot.join("movie.mkv"))]).await;

    assert_eq!(mirror.runs(), vec![None, None]);
}

#[tokio::test]
async fn dry_run_never_invokes_mirror() {
    let trees = trees();
    let mirror = Arc::new(RecordingMirror::default());
    let mut config = config(&trees);
    config.dry_run = true;
    let engine = SyncEngine::new(config, mirror.clone());

    run_to_end(&engine, vec![created(trees.hot.join("movie.mkv"))]).await;

    assert!(mirror.runs().is_empty());
}

#[tokio::test]
async fn events_during_initial_sync_wait_for_it() {
    let trees = trees();
    let mirror = Arc::new(RecordingMirror::slow(Duration::from_millis(150)));
    let engine = SyncEngine::new(config(&trees), mirror.clone());

    let (tx, rx) = mpsc::channel(16);
    let producer = async {
        tx.send(created(trees.hot.join("movie.mkv"))).await.unwrap();
        tx.send(created(trees.hot.join("season/e01.mkv"))).await.unwrap();
        drop(tx);
    };
    tokio::join!(
        engine.run_with_events(ReceiverStream::new(rx), CancellationToken::new()),
        producer,
    );

    assert_eq!(
        mirror.runs(),
        vec![
            None,
            Some(vec![PathBuf::from("movie.mkv"), PathBuf::from("season/e01.mkv")]),
        ]
    );
}

#[tokio::test]
async fn cancel_ends_an_idle_engine() {
    let trees = trees();
    let mirror = Arc::new(RecordingMirror::default());
    let engine = SyncEngine::new(config(&trees), mirror.clone());
    let cancel = CancellationToken::new();

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            engine.run_with_events(stream::pending::<ChangeEvent>(), cancel.clone()),
            stopper,
        )
    })
    .await
    .expect("engine stops after cancel");

    assert_eq!(mirror.runs(), vec![None]);
}

#[tokio::test]
async fn events_queued_before_cancel_are_still_mirrored() {
    let trees = trees();
    fs::write(trees.hot.join("a.mkv"), b"a").unwrap();
    let mirror = Arc::new(RecordingMirror::slow(Duration::from_millis(200)));
    let engine = SyncEngine::new(config(&trees), mirror.clone());
    let cancel = CancellationToken::new();

    // The sender stays alive, so only the cancel can end the stream.
    let (tx, rx) = mpsc::channel(16);
    let producer = async {
        tx.send(created(trees.hot.join("a.mkv"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            engine.run_with_events(ReceiverStream::new(rx), cancel.clone()),
            producer,
        )
    })
    .await
    .expect("engine drains and stops after cancel");

    assert_eq!(mirror.runs(), vec![None, Some(vec![PathBuf::from("a.mkv")])]);
    drop(tx);
}

fn rsync_available() -> bool {
    std::process::Command::new("rsync")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

#[tokio::test]
async fn rsync_mirror_preserves_hard_links() {
    if !rsync_available() {
        eprintln!("rsync not installed, skipping");
        return;
    }
    let trees = trees();
    fs::hard_link(trees.hot.join("movie.mkv"), trees.hot.join("season/linked.mkv")).unwrap();
    let mirror = RsyncMirror::default().with_flags(["--hard-links", "--times", "--recursive", "--perms"]);

    mirror.replicate(&trees.hot, &trees.cold, None).await.expect("full mirror");
    let a = fs::metadata(trees.cold.join("movie.mkv")).unwrap();
    let b = fs::metadata(trees.cold.join("season/linked.mkv")).unwrap();
    assert_eq!(a.ino(), b.ino());

    fs::create_dir_all(trees.hot.join("new/deep")).unwrap();
    fs::write(trees.hot.join("new/deep/e02.mkv"), b"e02").unwrap();
    let files = [PathBuf::from("new/deep/e02.mkv")];
    mirror
        .replicate(&trees.hot, &trees.cold, Some(&files[..]))
        .await
        .expect("file-list mirror");
    assert_eq!(fs::read(trees.cold.join("new/deep/e02.mkv")).unwrap(), b"e02");
}
