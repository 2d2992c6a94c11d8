use std::path::{Component, Path, PathBuf};

use crate::client::{Torrent, TorrentFile};

/// Maps paths as the torrent client reports them onto a local tree.
///
/// The client's default save path corresponds to `local_root`; a torrent saved anywhere below it
/// keeps its relative position. Paths outside the default save path have no local counterpart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathMapper {
    client_root: PathBuf,
    local_root: PathBuf,
}

impl PathMapper {
    pub fn new(client_root: impl Into<PathBuf>, local_root: impl Into<PathBuf>) -> Self {
        Self {
            client_root: client_root.into(),
            local_root: local_root.into(),
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Local path of one file of `torrent`, or `None` when it cannot be placed under the root.
    pub fn map(&self, torrent: &Torrent, file: &TorrentFile) -> Option<PathBuf> {
        let absolute = torrent.save_path.join(&file.name);
        let relative = absolute.strip_prefix(&self.client_root).ok()?;

        // Never let a crafted file name climb out of the root.
        let plain = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !plain || relative.as_os_str().is_empty() {
            return None;
        }
        Some(self.local_root.join(relative))
    }

    /// Map every file, failing as a whole if any one cannot be placed.
    pub fn map_all(&self, torrent: &Torrent, files: &[TorrentFile]) -> Option<Vec<PathBuf>> {
        files.iter().map(|file| self.map(torrent, file)).collect()
    }
}
