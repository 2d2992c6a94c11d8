pub mod sources;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use qbrouter_core::fs_watch::WatchConfig;
use qbrouter_core::migration::{HardlinkRoot, MigrationConfig, MoveTimeouts, PolicyConfig};
use qbrouter_core::sync::SyncConfig;
use url::Url;

/// Fully resolved configuration: every default applied, every value parsed.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: ClientConfig,
    pub destination: ClientConfig,
    pub paths: PathsConfig,
    pub sync: SyncSettings,
    pub migration: MigrationSettings,
    pub policy: PolicyConfig,
    pub dry_run: bool,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Settings for the sync engine.
    pub fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(&self.paths.source, &self.paths.destination);
        config.batch_window = self.sync.batch_window;
        config.poll_timeout = self.sync.poll_timeout;
        config.queue_capacity = self.sync.queue_capacity;
        config.dry_run = self.dry_run;
        config.watch = WatchConfig::default();
        config
    }

    /// Settings for the migration engine.
    pub fn migration_config(&self) -> MigrationConfig {
        let mut config = MigrationConfig::new(&self.paths.source, &self.paths.destination);
        config.synced_tag = self.migration.synced_tag.clone();
        config.sleep = self.migration.sleep;
        config.hardlink_root = self.paths.hardlink_root;
        config.policy = self.policy.clone();
        config.timeouts = self.migration.timeouts;
        config.dry_run = self.dry_run;
        config
    }
}

/// Connection settings for one qBittorrent instance.
#[derive(Clone)]
pub struct ClientConfig {
    pub url: Url,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Hot tree; the source client's default save path as seen locally.
    pub source: PathBuf,
    /// Cold tree receiving the mirror.
    pub destination: PathBuf,
    pub hardlink_root: HardlinkRoot,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_window: Duration,
    pub poll_timeout: Duration,
    pub queue_capacity: usize,
    pub rsync_path: PathBuf,
    /// `None` keeps the built-in flag set.
    pub rsync_flags: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub sleep: Duration,
    pub synced_tag: String,
    pub timeouts: MoveTimeouts,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    /// TOML file the configuration was read from, if any.
    pub config_path: Option<PathBuf>,
}
