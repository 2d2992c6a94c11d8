use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Raw configuration as defined in a TOML file. Every key is optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub source: FileClientConfig,
    #[serde(default)]
    pub destination: FileClientConfig,
    #[serde(default)]
    pub paths: FilePathsConfig,
    #[serde(default)]
    pub sync: FileSyncConfig,
    #[serde(default)]
    pub migration: FileMigrationConfig,
    #[serde(default)]
    pub policy: FilePolicyConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilePathsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    /// `"source"` or `"destination"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardlink_root: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileSyncConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_window: Option<DurationSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_timeout: Option<DurationSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsync_path: Option<PathBuf>,
    /// Replaces the default rsync flag set entirely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsync_flags: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileMigrationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep: Option<DurationSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout: Option<DurationSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appear_timeout: Option<DurationSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_timeout: Option<DurationSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<DurationSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

/// Free-space values are in GiB.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilePolicyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_free_space: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_seeding_time: Option<DurationSetting>,
    #[serde(default)]
    pub baseline: FileThresholds,
    #[serde(default)]
    pub low: FileTier,
    #[serde(default)]
    pub critical: FileTier,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileThresholds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popularity: Option<f64>,
    /// GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeding_time: Option<DurationSetting>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileTier {
    /// GiB of free space below which this tier applies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub below_free_space: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub popularity: Option<f64>,
    /// GiB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeding_time: Option<DurationSetting>,
}

/// A duration written either as whole seconds (`30`) or a humantime string (`"5m"`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DurationSetting {
    Seconds(u64),
    Text(String),
}

/// Values given on the command line (or their environment variables). They win over the file.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub source_path: Option<PathBuf>,
    pub destination_path: Option<PathBuf>,
    pub source_url: Option<String>,
    pub source_username: Option<String>,
    pub source_password: Option<String>,
    pub destination_url: Option<String>,
    pub destination_username: Option<String>,
    pub destination_password: Option<String>,
    /// GiB.
    pub min_free_space: Option<f64>,
    pub min_seeding_time: Option<Duration>,
    pub sleep: Option<Duration>,
    pub dry_run: Option<bool>,
}
