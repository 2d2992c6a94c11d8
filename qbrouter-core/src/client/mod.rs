//! Torrent-client capability set.
//!
//! Engines talk to a [`TorrentClient`]; the WebAPI backend, the caching decorator and the
//! in-memory fake all implement it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

mod cached;
pub mod memory;
mod qbittorrent;
mod types;

pub use cached::{CacheTtls, CachedClient};
pub use qbittorrent::{QbittorrentClient, QbittorrentOptions};
pub use types::{
    AddOutcome, AddTorrentRequest, SortKey, StateFilter, Torrent, TorrentFile, TorrentQuery,
    TorrentState,
};

/// Operations against one torrent-client instance.
///
/// Every call fails with [`RouterError::Remote`](crate::RouterError::Remote) on a non-success
/// response; callers treat those as retryable.
#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Short label used in log lines ("source", "destination").
    fn label(&self) -> &str;

    async fn list_torrents(&self, query: &TorrentQuery) -> Result<Vec<Torrent>>;

    async fn get_torrent(&self, hash: &str) -> Result<Option<Torrent>> {
        let mut found = self.list_torrents(&TorrentQuery::by_hash(hash)).await?;
        Ok(found
            .iter()
            .position(|torrent| torrent.hash == hash)
            .map(|idx| found.swap_remove(idx)))
    }

    async fn torrent_files(&self, hash: &str) -> Result<Vec<TorrentFile>>;

    async fn default_save_path(&self) -> Result<PathBuf>;

    /// Free bytes on the client's download disk.
    async fn free_space(&self) -> Result<u64>;

    async fn add_tag(&self, hash: &str, tag: &str) -> Result<()>;

    async fn stop(&self, hash: &str) -> Result<()>;

    async fn start(&self, hash: &str) -> Result<()>;

    async fn delete(&self, hash: &str, delete_files: bool) -> Result<()>;

    /// Raw `.torrent` metadata.
    async fn export(&self, hash: &str) -> Result<Vec<u8>>;

    async fn add(&self, request: AddTorrentRequest) -> Result<AddOutcome>;
}

#[async_trait]
impl<T: TorrentClient + ?Sized> TorrentClient for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn list_torrents(&self, query: &TorrentQuery) -> Result<Vec<Torrent>> {
        (**self).list_torrents(query).await
    }

    async fn get_torrent(&self, hash: &str) -> Result<Option<Torrent>> {
        (**self).get_torrent(hash).await
    }

    async fn torrent_files(&self, hash: &str) -> Result<Vec<TorrentFile>> {
        (**self).torrent_files(hash).await
    }

    async fn default_save_path(&self) -> Result<PathBuf> {
        (**self).default_save_path().await
    }

    async fn free_space(&self) -> Result<u64> {
        (**self).free_space().await
    }

    async fn add_tag(&self, hash: &str, tag: &str) -> Result<()> {
        (**self).add_tag(hash, tag).await
    }

    async fn stop(&self, hash: &str) -> Result<()> {
        (**self).stop(hash).await
    }

    async fn start(&self, hash: &str) -> Result<()> {
        (**self).start(hash).await
    }

    async fn delete(&self, hash: &str, delete_files: bool) -> Result<()> {
        (**self).delete(hash, delete_files).await
    }

    async fn export(&self, hash: &str) -> Result<Vec<u8>> {
        (**self).export(hash).await
    }

    async fn add(&self, request: AddTorrentRequest) -> Result<AddOutcome> {
        (**self).add(request).await
    }
}
