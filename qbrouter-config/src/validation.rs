use std::path::{Component, Path, PathBuf};

use qbrouter_core::migration::GIB;
use thiserror::Error;
use url::Url;

use crate::models::{ClientConfig, Config};

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("source and destination paths are the same: {}", path.display())]
    SamePaths { path: PathBuf },
    #[error("destination {} is inside source {}; the mirror would copy itself", destination_path.display(), source_path.display())]
    NestedDestination {
        source_path: PathBuf,
        destination_path: PathBuf,
    },
    #[error("source and destination clients share the URL {url}")]
    SameUrls { url: String },
    #[error("{field} must use http or https, got `{scheme}`")]
    UnsupportedScheme { field: &'static str, scheme: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    check_paths(&config.paths.source, &config.paths.destination)?;

    check_scheme("source URL", &config.source.url)?;
    check_scheme("destination URL", &config.destination.url)?;
    if same_endpoint(&config.source.url, &config.destination.url) {
        return Err(ConfigGuardRailError::SameUrls {
            url: config.source.url.to_string(),
        });
    }

    for (name, client) in [("source", &config.source), ("destination", &config.destination)] {
        check_credentials(name, client, &mut warnings);
    }

    let policy = &config.policy;
    for tier in &policy.tiers {
        if tier.below_free_space > policy.min_free_space {
            warnings.push_with_hint(
                format!(
                    "tier watermark {:.1} GiB is above min free space {:.1} GiB and never applies",
                    tier.below_free_space as f64 / GIB as f64,
                    policy.min_free_space as f64 / GIB as f64,
                ),
                "Keep critical <= low <= min_free_space",
            );
        }
    }
    if let [low, critical, ..] = policy.tiers.as_slice()
        && critical.below_free_space > low.below_free_space
    {
        warnings.push_with_hint(
            "critical tier watermark is above the low tier watermark",
            "Keep critical <= low <= min_free_space",
        );
    }

    if config.dry_run {
        warnings.push("dry-run enabled: decisions are logged but no changes are made");
    }

    Ok(warnings)
}

fn check_paths(source: &Path, destination: &Path) -> Result<(), ConfigGuardRailError> {
    let source = normalize(source);
    let destination = normalize(destination);

    if source == destination {
        return Err(ConfigGuardRailError::SamePaths { path: source });
    }
    if destination.starts_with(&source) {
        return Err(ConfigGuardRailError::NestedDestination {
            source_path: source,
            destination_path: destination,
        });
    }
    Ok(())
}

/// Resolve symlinks when the path exists, otherwise drop `.` and fold `..` lexically.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn check_scheme(field: &'static str, url: &Url) -> Result<(), ConfigGuardRailError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigGuardRailError::UnsupportedScheme {
            field,
            scheme: other.to_string(),
        }),
    }
}

fn same_endpoint(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
        && a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
}

fn check_credentials(name: &str, client: &ClientConfig, warnings: &mut ConfigWarnings) {
    if client.username.is_empty() || client.password.is_empty() {
        warnings.push_with_hint(
            format!("{name} client credentials are empty"),
            "Only works when the WebAPI bypasses authentication for this host",
        );
    }
}
