use tracing::{debug, info, warn};

use super::paths::PathMapper;
use crate::client::{Torrent, TorrentClient, TorrentQuery};
use crate::error::Result;

const TARGET: &str = "qbrouter::migrate";

/// Tag every completed, untagged torrent whose files all exist under the mapper's root.
///
/// `mapper` must map the client's default save path onto the destination tree. Returns the hashes
/// that were tagged (or would have been, in dry-run). A failure on one torrent is logged and
/// skipped; only failures to list torrents abort the phase.
pub async fn tag_synced(
    source: &dyn TorrentClient,
    mapper: &PathMapper,
    tag: &str,
    dry_run: bool,
) -> Result<Vec<String>> {
    let torrents = source.list_torrents(&TorrentQuery::completed()).await?;

    let mut tagged = Vec::new();
    for torrent in torrents.iter().filter(|t| !t.has_tag(tag)) {
        match is_replicated(source, mapper, torrent).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                warn!(target: TARGET, hash = %torrent.hash, error = %err, "cannot check replication");
                continue;
            }
        }

        info!(target: TARGET, dry_run, hash = %torrent.hash, name = %torrent.name, tag, "tagging torrent as synced");
        if !dry_run
            && let Err(err) = source.add_tag(&torrent.hash, tag).await
        {
            warn!(target: TARGET, hash = %torrent.hash, error = %err, "failed to tag torrent");
            continue;
        }
        tagged.push(torrent.hash.clone());
    }

    if tagged.is_empty() {
        info!(target: TARGET, "no torrents to tag as synced");
    }
    Ok(tagged)
}

/// Whether every file of `torrent` exists at its mapped destination path.
pub async fn is_replicated(
    client: &dyn TorrentClient,
    mapper: &PathMapper,
    torrent: &Torrent,
) -> Result<bool> {
    let files = client.torrent_files(&torrent.hash).await?;
    if files.is_empty() {
        debug!(target: TARGET, hash = %torrent.hash, "no files reported yet");
        return Ok(false);
    }

    for file in &files {
        let Some(path) = mapper.map(torrent, file) else {
            warn!(
                target: TARGET,
                hash = %torrent.hash,
                save_path = %torrent.save_path.display(),
                file = %file.name.display(),
                "file is outside the default save path, cannot be mirrored"
            );
            return Ok(false);
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(target: TARGET, hash = %torrent.hash, path = %path.display(), "torrent missing dest file");
            return Ok(false);
        }
    }
    Ok(true)
}
