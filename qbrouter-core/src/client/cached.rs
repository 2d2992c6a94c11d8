use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{AddOutcome, AddTorrentRequest, Torrent, TorrentFile, TorrentQuery};
use super::TorrentClient;
use crate::cache::TtlCache;
use crate::error::Result;

/// Lifetimes of the cached lookups.
#[derive(Clone, Copy, Debug)]
pub struct CacheTtls {
    pub files: Duration,
    pub save_path: Duration,
    pub free_space: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            files: Duration::from_secs(10),
            save_path: Duration::from_secs(60),
            free_space: Duration::from_secs(10),
        }
    }
}

/// Caches file lists, the default save path and free space in front of another client.
///
/// Torrent listings are never cached. Any mutating call drops the entries it may have changed.
pub struct CachedClient<C> {
    inner: C,
    files: TtlCache<String, Vec<TorrentFile>>,
    save_path: TtlCache<(), PathBuf>,
    free_space: TtlCache<(), u64>,
}

impl<C: TorrentClient> fmt::Debug for CachedClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedClient")
            .field("label", &self.inner.label())
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl<C: TorrentClient> CachedClient<C> {
    pub fn new(inner: C) -> Self {
        Self::with_ttls(inner, CacheTtls::default())
    }

    pub fn with_ttls(inner: C, ttls: CacheTtls) -> Self {
        Self {
            inner,
            files: TtlCache::new(ttls.files),
            save_path: TtlCache::new(ttls.save_path),
            free_space: TtlCache::new(ttls.free_space),
        }
    }

    /// Forget everything, e.g. before a decision that must see fresh state.
    pub async fn invalidate_all(&self) {
        self.files.invalidate_all().await;
        self.save_path.invalidate_all().await;
        self.free_space.invalidate_all().await;
    }
}

#[async_trait]
impl<C: TorrentClient> TorrentClient for CachedClient<C> {
    fn label(&self) -> &str {
        self.inner.label()
    }

    async fn list_torrents(&self, query: &TorrentQuery) -> Result<Vec<Torrent>> {
        self.inner.list_torrents(query).await
    }

    async fn get_torrent(&self, hash: &str) -> Result<Option<Torrent>> {
        self.inner.get_torrent(hash).await
    }

    async fn torrent_files(&self, hash: &str) -> Result<Vec<TorrentFile>> {
        self.files
            .get_or_try_insert_with(hash.to_string(), || self.inner.torrent_files(hash))
            .await
    }

    async fn default_save_path(&self) -> Result<PathBuf> {
        self.save_path
            .get_or_try_insert_with((), || self.inner.default_save_path())
            .await
    }

    async fn free_space(&self) -> Result<u64> {
        self.free_space
            .get_or_try_insert_with((), || self.inner.free_space())
            .await
    }

    async fn add_tag(&self, hash: &str, tag: &str) -> Result<()> {
        self.inner.add_tag(hash, tag).await
    }

    async fn stop(&self, hash: &str) -> Result<()> {
        self.inner.stop(hash).await
    }

    async fn start(&self, hash: &str) -> Result<()> {
        self.inner.start(hash).await
    }

    async fn delete(&self, hash: &str, delete_files: bool) -> Result<()> {
        let result = self.inner.delete(hash, delete_files).await;
        self.files.invalidate(&hash.to_string()).await;
        self.free_space.invalidate(&()).await;
        result
    }

    async fn export(&self, hash: &str) -> Result<Vec<u8>> {
        self.inner.export(hash).await
    }

    async fn add(&self, request: AddTorrentRequest) -> Result<AddOutcome> {
        let result = self.inner.add(request).await;
        self.free_space.invalidate(&()).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::memory::InMemoryClient;

    #[tokio::test(start_paused = true)]
    async fn free_space_is_cached_until_a_delete() {
        let inner = Arc::new(InMemoryClient::new("source"));
        inner.set_free_space(100);
        let cached = CachedClient::new(Arc::clone(&inner));

        assert_eq!(cached.free_space().await.unwrap(), 100);
        inner.set_free_space(50);
        assert_eq!(cached.free_space().await.unwrap(), 100);

        cached.delete("missing", true).await.ok();
        assert_eq!(cached.free_space().await.unwrap(), 50);

        inner.set_free_space(10);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cached.free_space().await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn file_lists_are_cached_per_hash() {
        let inner = Arc::new(InMemoryClient::new("source"));
        inner.insert_torrent(InMemoryClient::torrent("aa", "/hot"), vec![("a.mkv", 1)]);
        let cached = CachedClient::new(Arc::clone(&inner));

        assert_eq!(cached.torrent_files("aa").await.unwrap().len(), 1);
        inner.insert_torrent(
            InMemoryClient::torrent("aa", "/hot"),
            vec![("a.mkv", 1), ("b.nfo", 2)],
        );
        assert_eq!(cached.torrent_files("aa").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cached.torrent_files("aa").await.unwrap().len(), 2);
    }
}
