//! Partitioning torrents into groups that share on-disk data through hard links.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use tracing::debug;

use crate::client::Torrent;

const TARGET: &str = "qbrouter::migrate";

/// Torrents whose files are hard-linked to each other, collapsed into one eviction candidate.
///
/// Popularity and size are the maximum over members, seeding time the minimum, so the most
/// conservative member decides for the whole group.
#[derive(Clone, Debug, PartialEq)]
pub struct TorrentGroup {
    pub members: Vec<Torrent>,
    pub popularity: f64,
    pub size: u64,
    pub seeding_time: u64,
}

impl TorrentGroup {
    pub fn new(members: Vec<Torrent>) -> Self {
        let popularity = members
            .iter()
            .map(|t| t.popularity)
            .fold(0.0_f64, f64::max);
        let size = members.iter().map(|t| t.size).max().unwrap_or(0);
        let seeding_time = members.iter().map(|t| t.seeding_time).min().unwrap_or(0);
        Self {
            members,
            popularity,
            size,
            seeding_time,
        }
    }

    /// Name of the first member, for log lines.
    pub fn name(&self) -> &str {
        self.members.first().map_or("", |t| t.name.as_str())
    }

    pub fn hashes(&self) -> Vec<&str> {
        self.members.iter().map(|t| t.hash.as_str()).collect()
    }
}

/// Group `candidates` (torrent plus the local paths of its files) by shared inodes.
///
/// Two torrents land in the same group when any file of one is the same device/inode as any file
/// of the other, transitively. The partition does not depend on input order; groups are returned
/// in order of their earliest member. Torrents none of whose files can be found are dropped.
pub async fn group_by_hardlinks(candidates: Vec<(Torrent, Vec<PathBuf>)>) -> Vec<TorrentGroup> {
    let mut torrents = Vec::with_capacity(candidates.len());
    let mut owners: HashMap<(u64, u64), usize> = HashMap::new();
    let mut links = UnionFind::default();

    for (torrent, paths) in candidates {
        let mut identities = Vec::with_capacity(paths.len());
        for path in &paths {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() => identities.push((meta.dev(), meta.ino())),
                _ => debug!(target: TARGET, hash = %torrent.hash, path = %path.display(), "file not found"),
            }
        }
        if identities.is_empty() {
            debug!(target: TARGET, hash = %torrent.hash, name = %torrent.name, "no files on disk, dropping");
            continue;
        }

        let idx = links.push();
        for identity in identities {
            match owners.get(&identity) {
                Some(&owner) => {
                    if links.union(owner, idx) {
                        debug!(
                            target: TARGET,
                            hash = %torrent.hash,
                            other = %torrents_hash(&torrents, owner),
                            "torrents are hard-linked"
                        );
                    }
                }
                None => {
                    owners.insert(identity, idx);
                }
            }
        }
        torrents.push(torrent);
    }

    let mut slots: HashMap<usize, usize> = HashMap::new();
    let mut grouped: Vec<Vec<Torrent>> = Vec::new();
    for (idx, torrent) in torrents.into_iter().enumerate() {
        let root = links.find(idx);
        let slot = *slots.entry(root).or_insert_with(|| {
            grouped.push(Vec::new());
            grouped.len() - 1
        });
        grouped[slot].push(torrent);
    }

    grouped.into_iter().map(TorrentGroup::new).collect()
}

fn torrents_hash(torrents: &[Torrent], idx: usize) -> &str {
    torrents.get(idx).map_or("", |t| t.hash.as_str())
}

#[derive(Default)]
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn push(&mut self) -> usize {
        self.parent.push(self.parent.len());
        self.parent.len() - 1
    }

    fn find(&mut self, mut idx: usize) -> usize {
        while self.parent[idx] != idx {
            self.parent[idx] = self.parent[self.parent[idx]];
            idx = self.parent[idx];
        }
        idx
    }

    /// Join two sets, keeping the smaller index as root. Returns whether they were separate.
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        true
    }
}
