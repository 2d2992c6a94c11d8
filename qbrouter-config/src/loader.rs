use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use qbrouter_core::migration::{HardlinkRoot, MoveTimeouts, PolicyConfig, SYNCED_TAG, Thresholds, Tier};
use thiserror::Error;
use url::Url;

use crate::models::sources::{
    ConfigOverrides, DurationSetting, FileClientConfig, FileConfig, FilePolicyConfig, FileThresholds,
    FileTier,
};
use crate::models::{
    ClientConfig, Config, ConfigMetadata, MigrationSettings, PathsConfig, SyncSettings,
};
use crate::util::{gib_to_bytes, parse_duration};
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};

/// Probed in order when no file is named explicitly.
pub const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["qbrouter.toml", "config/qbrouter.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

/// Merges overrides, the optional TOML file and built-in defaults, then validates the result.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.options.overrides = overrides;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (file, config_path) = self.load_file_config()?;
        self.compose_config(file.unwrap_or_default(), config_path)
    }

    fn load_file_config(&self) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let path = match &self.options.config_path {
            Some(explicit) => {
                if !explicit.exists() {
                    return Err(ConfigLoadError::MissingConfig {
                        path: explicit.clone(),
                    });
                }
                explicit.clone()
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(found) => found,
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file = toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok((Some(file), Some(path)))
    }

    fn compose_config(
        &self,
        file: FileConfig,
        config_path: Option<PathBuf>,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let overrides = self.options.overrides.clone();
        let FileConfig {
            source: file_source,
            destination: file_destination,
            paths: file_paths,
            sync: file_sync,
            migration: file_migration,
            policy: file_policy,
        } = file;

        let source = client_config(
            "source",
            overrides.source_url,
            overrides.source_username,
            overrides.source_password,
            file_source,
        )?;
        let destination = client_config(
            "destination",
            overrides.destination_url,
            overrides.destination_username,
            overrides.destination_password,
            file_destination,
        )?;

        let hardlink_root = match file_paths.hardlink_root.as_deref().map(str::trim) {
            None => HardlinkRoot::default(),
            Some(raw) if raw.eq_ignore_ascii_case("destination") => HardlinkRoot::Destination,
            Some(raw) if raw.eq_ignore_ascii_case("source") => HardlinkRoot::Source,
            Some(other) => {
                return Err(ConfigLoadError::InvalidValue {
                    field: "paths.hardlink_root",
                    value: other.to_string(),
                    reason: "expected `source` or `destination`".into(),
                });
            }
        };
        let paths = PathsConfig {
            source: overrides
                .source_path
                .or(file_paths.source)
                .ok_or(ConfigLoadError::MissingValue {
                    field: "source path",
                    hint: "--src / SRC_PATH or [paths] source",
                })?,
            destination: overrides
                .destination_path
                .or(file_paths.destination)
                .ok_or(ConfigLoadError::MissingValue {
                    field: "destination path",
                    hint: "--dest / DEST_PATH or [paths] destination",
                })?,
            hardlink_root,
        };

        let queue_capacity = file_sync.queue_capacity.unwrap_or(4096);
        if queue_capacity == 0 {
            return Err(ConfigLoadError::InvalidValue {
                field: "sync.queue_capacity",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let sync = SyncSettings {
            batch_window: duration("sync.batch_window", file_sync.batch_window, 15)?,
            poll_timeout: duration("sync.poll_timeout", file_sync.poll_timeout, 5)?,
            queue_capacity,
            rsync_path: file_sync
                .rsync_path
                .unwrap_or_else(|| PathBuf::from("rsync")),
            rsync_flags: file_sync.rsync_flags,
        };

        let sleep = match overrides.sleep {
            Some(sleep) => sleep,
            None => duration("migration.sleep", file_migration.sleep, 30)?,
        };
        let migration = MigrationSettings {
            sleep,
            synced_tag: file_migration
                .synced_tag
                .filter(|tag| !tag.trim().is_empty())
                .unwrap_or_else(|| SYNCED_TAG.to_string()),
            timeouts: MoveTimeouts {
                stop: duration("migration.stop_timeout", file_migration.stop_timeout, 30)?,
                appear: duration("migration.appear_timeout", file_migration.appear_timeout, 20)?,
                verify: duration("migration.verify_timeout", file_migration.verify_timeout, 300)?,
                poll_interval: duration("migration.poll_interval", file_migration.poll_interval, 1)?,
            },
        };

        let policy = policy_config(
            overrides.min_free_space,
            overrides.min_seeding_time,
            file_policy,
        )?;
        let dry_run = overrides
            .dry_run
            .or(file_migration.dry_run)
            .unwrap_or(false);

        let config = Config {
            source,
            destination,
            paths,
            sync,
            migration,
            policy,
            dry_run,
            metadata: ConfigMetadata { config_path },
        };

        let warnings = validation::apply_guard_rails(&config)?;
        Ok(ConfigLoad { config, warnings })
    }
}

fn client_config(
    role: &'static str,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    file: FileClientConfig,
) -> Result<ClientConfig, ConfigLoadError> {
    let raw = url
        .or(file.url)
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigLoadError::MissingValue {
            field: if role == "source" { "source URL" } else { "destination URL" },
            hint: if role == "source" {
                "--src-url / QB_SRC_URL or [source] url"
            } else {
                "--dest-url / QB_DEST_URL or [destination] url"
            },
        })?;
    let url = Url::parse(raw.trim()).map_err(|source| ConfigLoadError::InvalidUrl {
        role,
        url: raw.clone(),
        source,
    })?;

    Ok(ClientConfig {
        url,
        username: username.or(file.username).unwrap_or_default(),
        password: password.or(file.password).unwrap_or_default(),
    })
}

fn policy_config(
    min_free_space: Option<f64>,
    min_seeding_time: Option<Duration>,
    file: FilePolicyConfig,
) -> Result<PolicyConfig, ConfigLoadError> {
    let defaults = PolicyConfig::default();

    let min_free_space = match min_free_space.or(file.min_free_space) {
        Some(gib) => gib_bytes("policy.min_free_space", gib)?,
        None => defaults.min_free_space,
    };
    let min_seeding_time = match min_seeding_time {
        Some(duration) => duration.as_secs(),
        None => seconds(
            "policy.min_seeding_time",
            file.min_seeding_time,
            defaults.min_seeding_time,
        )?,
    };

    Ok(PolicyConfig {
        min_free_space,
        min_seeding_time,
        baseline: thresholds("policy.baseline", file.baseline, defaults.baseline)?,
        tiers: vec![
            tier("policy.low", file.low, Tier::LOW)?,
            tier("policy.critical", file.critical, Tier::CRITICAL)?,
        ],
    })
}

fn thresholds(
    section: &'static str,
    file: FileThresholds,
    default: Thresholds,
) -> Result<Thresholds, ConfigLoadError> {
    Ok(Thresholds {
        popularity: file.popularity.unwrap_or(default.popularity),
        size: match file.size {
            Some(gib) => gib_bytes(section, gib)?,
            None => default.size,
        },
        seeding_time: seconds(section, file.seeding_time, default.seeding_time)?,
    })
}

fn tier(section: &'static str, file: FileTier, default: Tier) -> Result<Tier, ConfigLoadError> {
    let below_free_space = match file.below_free_space {
        Some(gib) => gib_bytes(section, gib)?,
        None => default.below_free_space,
    };
    let thresholds = thresholds(
        section,
        FileThresholds {
            popularity: file.popularity,
            size: file.size,
            seeding_time: file.seeding_time,
        },
        default.thresholds,
    )?;
    Ok(Tier {
        below_free_space,
        thresholds,
    })
}

fn gib_bytes(field: &'static str, gib: f64) -> Result<u64, ConfigLoadError> {
    gib_to_bytes(gib).map_err(|reason| ConfigLoadError::InvalidValue {
        field,
        value: gib.to_string(),
        reason,
    })
}

fn duration(
    field: &'static str,
    setting: Option<DurationSetting>,
    default_secs: u64,
) -> Result<Duration, ConfigLoadError> {
    match setting {
        None => Ok(Duration::from_secs(default_secs)),
        Some(DurationSetting::Seconds(secs)) => Ok(Duration::from_secs(secs)),
        Some(DurationSetting::Text(raw)) => {
            parse_duration(&raw).map_err(|reason| ConfigLoadError::InvalidValue {
                field,
                value: raw,
                reason,
            })
        }
    }
}

fn seconds(
    field: &'static str,
    setting: Option<DurationSetting>,
    default_secs: u64,
) -> Result<u64, ConfigLoadError> {
    duration(field, setting, default_secs).map(|d| d.as_secs())
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {}", path.display())]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{field} is required (set {hint})")]
    MissingValue {
        field: &'static str,
        hint: &'static str,
    },
    #[error("invalid {role} URL `{url}`")]
    InvalidUrl {
        role: &'static str,
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value `{value}` for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
}

#[cfg(test)]
mod tests {
    use qbrouter_core::migration::GIB;

    use super::*;

    fn overrides() -> ConfigOverrides {
        ConfigOverrides {
            source_path: Some("/data/hot".into()),
            destination_path: Some("/data/cold".into()),
            source_url: Some("http://hot:8080".into()),
            source_username: Some("admin".into()),
            source_password: Some("secret".into()),
            destination_url: Some("http://cold:8080".into()),
            destination_username: Some("admin".into()),
            destination_password: Some("secret".into()),
            ..ConfigOverrides::default()
        }
    }

    fn compose(file: FileConfig, overrides: ConfigOverrides) -> Result<ConfigLoad, ConfigLoadError> {
        ConfigLoader::new()
            .with_overrides(overrides)
            .compose_config(file, None)
    }

    #[test]
    fn defaults_fill_every_unset_value() {
        let ConfigLoad { config, warnings } = compose(FileConfig::default(), overrides()).unwrap();

        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(config.sync.batch_window, Duration::from_secs(15));
        assert_eq!(config.sync.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.sync.queue_capacity, 4096);
        assert_eq!(config.sync.rsync_path, PathBuf::from("rsync"));
        assert_eq!(config.migration.sleep, Duration::from_secs(30));
        assert_eq!(config.migration.synced_tag, "synced");
        assert_eq!(config.migration.timeouts, MoveTimeouts::default());
        assert_eq!(config.policy, PolicyConfig::default());
        assert_eq!(config.paths.hardlink_root, HardlinkRoot::Destination);
        assert!(!config.dry_run);
    }

    #[test]
    fn overrides_win_over_file_values() {
        let mut file = FileConfig::default();
        file.policy.min_free_space = Some(10.0);
        file.migration.sleep = Some(DurationSetting::Text("2m".into()));
        file.migration.dry_run = Some(true);

        let mut overrides = overrides();
        overrides.min_free_space = Some(75.0);
        overrides.dry_run = Some(false);
        let config = compose(file, overrides).unwrap().config;

        assert_eq!(config.policy.min_free_space, 75 * GIB);
        assert_eq!(config.migration.sleep, Duration::from_secs(120));
        assert!(!config.dry_run);
    }

    #[test]
    fn missing_url_is_reported() {
        let mut overrides = overrides();
        overrides.destination_url = None;
        let err = compose(FileConfig::default(), overrides).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::MissingValue {
                field: "destination URL",
                ..
            }
        ));
    }

    #[test]
    fn bad_duration_names_the_field() {
        let mut file = FileConfig::default();
        file.sync.poll_timeout = Some(DurationSetting::Text("eventually".into()));
        match compose(file, overrides()) {
            Err(ConfigLoadError::InvalidValue { field, .. }) => assert_eq!(field, "sync.poll_timeout"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn same_urls_fail_guard_rails() {
        let mut overrides = overrides();
        overrides.destination_url = Some("http://hot:8080/".into());
        assert!(matches!(
            compose(FileConfig::default(), overrides),
            Err(ConfigLoadError::GuardRail(ConfigGuardRailError::SameUrls { .. }))
        ));
    }

    #[test]
    fn misordered_tiers_and_dry_run_warn() {
        let mut file = FileConfig::default();
        file.policy.critical.below_free_space = Some(30.0);
        let mut overrides = overrides();
        overrides.dry_run = Some(true);
        overrides.destination_password = Some(String::new());

        let warnings = compose(file, overrides).unwrap().warnings;
        let messages: Vec<&str> = warnings.iter().map(|w| w.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("critical tier")));
        assert!(messages.iter().any(|m| m.contains("destination client credentials")));
        assert!(messages.iter().any(|m| m.contains("dry-run")));
    }
}
