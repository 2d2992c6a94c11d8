use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Torrent as reported by `/api/v2/torrents/info`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Torrent {
    pub hash: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub save_path: PathBuf,
    #[serde(default)]
    pub category: String,
    #[serde(default, with = "tag_list")]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub state: TorrentState,
    #[serde(default)]
    pub size: u64,
    /// Missing on servers older than 4.6.
    #[serde(default)]
    pub popularity: f64,
    /// Seconds spent seeding.
    #[serde(default)]
    pub seeding_time: u64,
    #[serde(default)]
    pub auto_tmm: bool,
}

impl Torrent {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// `state` field of a torrent. Unrecognised values map to [`TorrentState::Unknown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TorrentState {
    Error,
    MissingFiles,
    Uploading,
    #[serde(rename = "pausedUP")]
    PausedUp,
    #[serde(rename = "stoppedUP")]
    StoppedUp,
    #[serde(rename = "queuedUP")]
    QueuedUp,
    #[serde(rename = "stalledUP")]
    StalledUp,
    #[serde(rename = "checkingUP")]
    CheckingUp,
    #[serde(rename = "forcedUP")]
    ForcedUp,
    Allocating,
    Downloading,
    #[serde(rename = "metaDL")]
    MetaDl,
    #[serde(rename = "forcedMetaDL")]
    ForcedMetaDl,
    #[serde(rename = "pausedDL")]
    PausedDl,
    #[serde(rename = "stoppedDL")]
    StoppedDl,
    #[serde(rename = "queuedDL")]
    QueuedDl,
    #[serde(rename = "stalledDL")]
    StalledDl,
    #[serde(rename = "checkingDL")]
    CheckingDl,
    #[serde(rename = "forcedDL")]
    ForcedDl,
    CheckingResumeData,
    Moving,
    #[default]
    #[serde(other)]
    Unknown,
}

impl TorrentState {
    /// Finished downloading, whatever it is doing now.
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            TorrentState::Uploading
                | TorrentState::PausedUp
                | TorrentState::StoppedUp
                | TorrentState::QueuedUp
                | TorrentState::StalledUp
                | TorrentState::CheckingUp
                | TorrentState::ForcedUp
        )
    }

    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            TorrentState::PausedUp
                | TorrentState::StoppedUp
                | TorrentState::PausedDl
                | TorrentState::StoppedDl
        )
    }

    /// Actively seeding or queued to seed.
    pub fn is_uploading(self) -> bool {
        matches!(
            self,
            TorrentState::Uploading
                | TorrentState::StalledUp
                | TorrentState::QueuedUp
                | TorrentState::ForcedUp
                | TorrentState::CheckingUp
        )
    }

    /// Transient states during which the client is still ingesting or hashing data.
    pub fn is_checking(self) -> bool {
        matches!(
            self,
            TorrentState::CheckingUp
                | TorrentState::CheckingDl
                | TorrentState::CheckingResumeData
                | TorrentState::Allocating
                | TorrentState::MetaDl
                | TorrentState::ForcedMetaDl
                | TorrentState::Moving
        )
    }

    /// The client holds the complete data and has finished verifying it.
    pub fn is_verified(self) -> bool {
        self.is_complete() && !self.is_checking()
    }
}

/// One file of a torrent, relative to the torrent's save path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentFile {
    pub name: PathBuf,
    #[serde(default)]
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateFilter {
    Completed,
    Stopped,
}

impl StateFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            StateFilter::Completed => "completed",
            StateFilter::Stopped => "stopped",
        }
    }

    pub fn matches(self, state: TorrentState) -> bool {
        match self {
            StateFilter::Completed => state.is_complete(),
            StateFilter::Stopped => state.is_stopped(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    Size,
    Name,
}

impl SortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Size => "size",
            SortKey::Name => "name",
        }
    }
}

/// Parameters for listing torrents. The default lists everything unsorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TorrentQuery {
    pub filter: Option<StateFilter>,
    pub tag: Option<String>,
    pub sort: Option<SortKey>,
    pub reverse: bool,
    pub hashes: Vec<String>,
}

impl TorrentQuery {
    pub fn completed() -> Self {
        Self {
            filter: Some(StateFilter::Completed),
            ..Self::default()
        }
    }

    pub fn by_hash(hash: impl Into<String>) -> Self {
        Self {
            hashes: vec![hash.into()],
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn sorted_by(mut self, key: SortKey, reverse: bool) -> Self {
        self.sort = Some(key);
        self.reverse = reverse;
        self
    }

    /// Client-side evaluation of the query, for backends without server-side filtering.
    pub fn matches(&self, torrent: &Torrent) -> bool {
        self.filter.is_none_or(|filter| filter.matches(torrent.state))
            && self.tag.as_deref().is_none_or(|tag| torrent.has_tag(tag))
            && (self.hashes.is_empty() || self.hashes.iter().any(|h| h == &torrent.hash))
    }
}

/// Everything needed to recreate a torrent on another client.
#[derive(Clone, PartialEq)]
pub struct AddTorrentRequest {
    /// Raw `.torrent` metadata.
    pub metadata: Vec<u8>,
    pub save_path: PathBuf,
    pub category: String,
    pub tags: BTreeSet<String>,
    pub auto_tmm: bool,
    pub paused: bool,
}

impl fmt::Debug for AddTorrentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddTorrentRequest")
            .field("metadata_len", &self.metadata.len())
            .field("save_path", &self.save_path)
            .field("category", &self.category)
            .field("tags", &self.tags)
            .field("auto_tmm", &self.auto_tmm)
            .field("paused", &self.paused)
            .finish()
    }
}

impl AddTorrentRequest {
    /// Mirror `torrent`'s placement and labels, submitted stopped.
    pub fn like(torrent: &Torrent, metadata: Vec<u8>) -> Self {
        Self {
            metadata,
            save_path: torrent.save_path.clone(),
            category: torrent.category.clone(),
            tags: torrent.tags.clone(),
            auto_tmm: torrent.auto_tmm,
            paused: true,
        }
    }
}

/// Result of `torrents/add`. The server answers `Ok.` on success and a short reason otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    Rejected(String),
}

impl AddOutcome {
    pub fn from_body(body: &str) -> Self {
        match body.trim() {
            "Ok." => AddOutcome::Accepted,
            other => AddOutcome::Rejected(other.to_string()),
        }
    }
}

/// Comma-separated tag list on the wire, a set in memory.
pub(crate) mod tag_list {
    use std::collections::BTreeSet;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tags: &BTreeSet<String>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&join(tags))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<String>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(split(&raw))
    }

    pub fn split(raw: &str) -> BTreeSet<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn join(tags: &BTreeSet<String>) -> String {
        tags.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }
}
