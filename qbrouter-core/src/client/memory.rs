//! In-memory [`TorrentClient`] for tests and dry experiments.
//!
//! Behaves like a small qBittorrent: stopping, starting, tagging, exporting and adding torrents
//! all change the stored state, and every mutating call is recorded so tests can assert on what
//! an engine did. Exported metadata is a JSON document understood only by this fake.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{
    AddOutcome, AddTorrentRequest, SortKey, Torrent, TorrentFile, TorrentQuery, TorrentState,
};
use super::TorrentClient;
use crate::error::{Result, RouterError};

/// A mutating call received by the fake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    AddTag { hash: String, tag: String },
    Stop(String),
    Start(String),
    Delete { hash: String, delete_files: bool },
    Export(String),
    Add { hash: String, paused: bool },
}

impl Call {
    pub fn hash(&self) -> &str {
        match self {
            Call::AddTag { hash, .. }
            | Call::Delete { hash, .. }
            | Call::Add { hash, .. }
            | Call::Stop(hash)
            | Call::Start(hash)
            | Call::Export(hash) => hash,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Exported {
    torrent: Torrent,
    files: Vec<TorrentFile>,
}

struct Entry {
    torrent: Torrent,
    files: Vec<TorrentFile>,
    /// Observations left before the torrent shows up in listings.
    hidden_for: u32,
    /// Observations left before a freshly added torrent finishes checking.
    checking_for: Option<u32>,
    /// State to settle in once checking finishes.
    settle_to: TorrentState,
}

impl Entry {
    fn observe(&mut self) -> Option<Torrent> {
        if self.hidden_for > 0 {
            self.hidden_for -= 1;
            return None;
        }
        match self.checking_for {
            Some(0) => {
                self.checking_for = None;
                self.torrent.state = self.settle_to;
            }
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        Some(self.torrent.clone())
    }
}

struct State {
    entries: Vec<Entry>,
    free_space: u64,
    save_path: PathBuf,
    calls: Vec<Call>,
    ignore_stop: bool,
    reject_add: Option<String>,
    add_hidden_for: u32,
    add_checking_for: Option<u32>,
    reclaim_on_delete: bool,
}

/// In-memory torrent client. Cheap to share behind an `Arc`.
pub struct InMemoryClient {
    label: String,
    state: Mutex<State>,
}

impl fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryClient")
            .field("label", &self.label)
            .field("torrents", &state.entries.len())
            .field("free_space", &state.free_space)
            .finish()
    }
}

impl InMemoryClient {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(State {
                entries: Vec::new(),
                free_space: u64::MAX,
                save_path: PathBuf::from("/downloads"),
                calls: Vec::new(),
                ignore_stop: false,
                reject_add: None,
                add_hidden_for: 0,
                add_checking_for: Some(1),
                reclaim_on_delete: false,
            }),
        }
    }

    /// A completed, seeding torrent with neutral metrics.
    pub fn torrent(hash: &str, save_path: impl Into<PathBuf>) -> Torrent {
        Torrent {
            hash: hash.to_string(),
            name: hash.to_string(),
            save_path: save_path.into(),
            category: String::new(),
            tags: BTreeSet::new(),
            state: TorrentState::StalledUp,
            size: 0,
            popularity: 0.0,
            seeding_time: 0,
            auto_tmm: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a torrent.
    pub fn insert_torrent(&self, torrent: Torrent, files: Vec<(&str, u64)>) {
        let files = files
            .into_iter()
            .map(|(name, size)| TorrentFile {
                name: PathBuf::from(name),
                size,
            })
            .collect();
        let entry = Entry {
            settle_to: torrent.state,
            torrent,
            files,
            hidden_for: 0,
            checking_for: None,
        };

        let mut state = self.lock();
        state.entries.retain(|e| e.torrent.hash != entry.torrent.hash);
        state.entries.push(entry);
    }

    /// Current view of a torrent, without counting as an observation.
    pub fn torrent_snapshot(&self, hash: &str) -> Option<Torrent> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.torrent.hash == hash)
            .map(|e| e.torrent.clone())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.torrent_snapshot(hash).is_some()
    }

    pub fn set_free_space(&self, bytes: u64) {
        self.lock().free_space = bytes;
    }

    pub fn set_default_save_path(&self, path: impl Into<PathBuf>) {
        self.lock().save_path = path.into();
    }

    /// Accept stop requests without changing state.
    pub fn set_ignore_stop(&self, ignore: bool) {
        self.lock().ignore_stop = ignore;
    }

    /// Answer every add with this rejection body instead of `Ok.`.
    pub fn set_reject_add(&self, reason: Option<&str>) {
        self.lock().reject_add = reason.map(str::to_string);
    }

    /// Added torrents stay invisible for this many observations.
    pub fn set_add_hidden_for(&self, observations: u32) {
        self.lock().add_hidden_for = observations;
    }

    /// Added torrents report a checking state for this many observations; `None` keeps them
    /// checking forever.
    pub fn set_add_checking_for(&self, observations: Option<u32>) {
        self.lock().add_checking_for = observations;
    }

    /// Deleting a torrent with its files frees its size on the disk.
    pub fn set_reclaim_on_delete(&self, reclaim: bool) {
        self.lock().reclaim_on_delete = reclaim;
    }

    /// Mutating calls received so far.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, hash: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.hash() == hash)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn not_found(&self, endpoint: &str, hash: &str) -> RouterError {
        RouterError::remote(
            format!("{}:{endpoint}", self.label),
            404,
            format!("Torrent hash was not found: {hash}"),
        )
    }
}

#[async_trait]
impl TorrentClient for InMemoryClient {
    fn label(&self) -> &str {
        &self.label
    }

    async fn list_torrents(&self, query: &TorrentQuery) -> Result<Vec<Torrent>> {
        let mut state = self.lock();
        let mut found: Vec<Torrent> = state
            .entries
            .iter_mut()
            .filter_map(Entry::observe)
            .filter(|torrent| query.matches(torrent))
            .collect();

        match query.sort {
            Some(SortKey::Size) => found.sort_by_key(|t| t.size),
            Some(SortKey::Name) => found.sort_by(|a, b| a.name.cmp(&b.name)),
            None => {}
        }
        if query.sort.is_some() && query.reverse {
            found.reverse();
        }
        Ok(found)
    }

    async fn torrent_files(&self, hash: &str) -> Result<Vec<TorrentFile>> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.torrent.hash == hash)
            .map(|e| e.files.clone())
            .ok_or_else(|| self.not_found("torrents/files", hash))
    }

    async fn default_save_path(&self) -> Result<PathBuf> {
        Ok(self.lock().save_path.clone())
    }

    async fn free_space(&self) -> Result<u64> {
        Ok(self.lock().free_space)
    }

    async fn add_tag(&self, hash: &str, tag: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::AddTag {
            hash: hash.to_string(),
            tag: tag.to_string(),
        });
        if let Some(entry) = state.entries.iter_mut().find(|e| e.torrent.hash == hash) {
            entry.torrent.tags.insert(tag.to_string());
        }
        Ok(())
    }

    async fn stop(&self, hash: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Stop(hash.to_string()));
        let ignore = state.ignore_stop;
        if let Some(entry) = state.entries.iter_mut().find(|e| e.torrent.hash == hash)
            && !ignore
        {
            entry.checking_for = None;
            entry.torrent.state = if entry.torrent.state.is_complete() {
                TorrentState::StoppedUp
            } else {
                TorrentState::StoppedDl
            };
        }
        Ok(())
    }

    async fn start(&self, hash: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Start(hash.to_string()));
        if let Some(entry) = state.entries.iter_mut().find(|e| e.torrent.hash == hash) {
            let resumed = match entry.torrent.state {
                TorrentState::StoppedUp | TorrentState::PausedUp => TorrentState::StalledUp,
                TorrentState::StoppedDl | TorrentState::PausedDl => TorrentState::StalledDl,
                other => other,
            };
            entry.torrent.state = resumed;
            entry.settle_to = match entry.settle_to {
                TorrentState::StoppedUp | TorrentState::PausedUp => TorrentState::StalledUp,
                other => other,
            };
        }
        Ok(())
    }

    async fn delete(&self, hash: &str, delete_files: bool) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(Call::Delete {
            hash: hash.to_string(),
            delete_files,
        });
        let Some(idx) = state.entries.iter().position(|e| e.torrent.hash == hash) else {
            return Ok(());
        };
        let removed = state.entries.remove(idx);
        if delete_files && state.reclaim_on_delete {
            state.free_space = state.free_space.saturating_add(removed.torrent.size);
        }
        Ok(())
    }

    async fn export(&self, hash: &str) -> Result<Vec<u8>> {
        let mut state = self.lock();
        state.calls.push(Call::Export(hash.to_string()));
        let entry = state
            .entries
            .iter()
            .find(|e| e.torrent.hash == hash)
            .ok_or_else(|| self.not_found("torrents/export", hash))?;
        let exported = Exported {
            torrent: entry.torrent.clone(),
            files: entry.files.clone(),
        };
        serde_json::to_vec(&exported).map_err(|err| RouterError::Decode {
            what: "exported torrent".into(),
            reason: err.to_string(),
        })
    }

    async fn add(&self, request: AddTorrentRequest) -> Result<AddOutcome> {
        let exported: Exported = serde_json::from_slice(&request.metadata).map_err(|_| {
            RouterError::remote(
                format!("{}:torrents/add", self.label),
                415,
                "Torrent file is not valid",
            )
        })?;

        let mut state = self.lock();
        let hash = exported.torrent.hash.clone();
        state.calls.push(Call::Add {
            hash: hash.clone(),
            paused: request.paused,
        });

        if let Some(reason) = state.reject_add.clone() {
            return Ok(AddOutcome::Rejected(reason));
        }
        if state.entries.iter().any(|e| e.torrent.hash == hash) {
            return Ok(AddOutcome::Rejected("Fails.".into()));
        }

        let settle_to = if request.paused {
            TorrentState::StoppedUp
        } else {
            TorrentState::StalledUp
        };
        let checking_for = state.add_checking_for;
        let mut torrent = exported.torrent;
        torrent.save_path = request.save_path;
        torrent.category = request.category;
        torrent.tags = request.tags;
        torrent.auto_tmm = request.auto_tmm;
        torrent.seeding_time = 0;
        torrent.state = TorrentState::CheckingResumeData;

        let hidden_for = state.add_hidden_for;
        state.entries.push(Entry {
            torrent,
            files: exported.files,
            hidden_for,
            checking_for: Some(checking_for.unwrap_or(u32::MAX)),
            settle_to,
        });
        Ok(AddOutcome::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn export_then_add_recreates_the_torrent() {
        let source = InMemoryClient::new("source");
        let dest = InMemoryClient::new("destination");
        let mut torrent = InMemoryClient::torrent("abc", "/hot/movies");
        torrent.category = "movies".into();
        torrent.tags.insert("synced".into());
        source.insert_torrent(torrent.clone(), vec![("film.mkv", 10)]);

        let metadata = source.export("abc").await.unwrap();
        let outcome = dest
            .add(AddTorrentRequest::like(&torrent, metadata))
            .await
            .unwrap();
        assert_eq!(outcome, AddOutcome::Accepted);

        let first = dest.get_torrent("abc").await.unwrap().expect("visible");
        assert!(first.state.is_checking());
        let settled = dest.get_torrent("abc").await.unwrap().expect("visible");
        assert_eq!(settled.state, TorrentState::StoppedUp);
        assert_eq!(settled.category, "movies");
        assert_eq!(dest.torrent_files("abc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn garbage_metadata_is_rejected_remotely() {
        let dest = InMemoryClient::new("destination");
        let torrent = InMemoryClient::torrent("abc", "/hot");
        let err = dest
            .add(AddTorrentRequest::like(&torrent, b"d4:infod".to_vec()))
            .await
            .expect_err("not an export");
        assert!(matches!(err, RouterError::Remote { status: 415, .. }));
    }

    #[tokio::test]
    async fn listing_sorts_and_filters() {
        let client = InMemoryClient::new("source");
        for (hash, size, tag) in [("a", 30, true), ("b", 10, true), ("c", 20, false)] {
            let mut torrent = InMemoryClient::torrent(hash, "/hot");
            torrent.size = size;
            if tag {
                torrent.tags.insert("synced".into());
            }
            client.insert_torrent(torrent, vec![]);
        }

        let query = TorrentQuery::completed()
            .with_tag("synced")
            .sorted_by(SortKey::Size, false);
        let hashes: Vec<String> = client
            .list_torrents(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.hash)
            .collect();
        assert_eq!(hashes, ["b", "a"]);
    }
}
