//! Configuration for qbrouter.
//!
//! Values come from command-line overrides (which clap also fills from environment variables),
//! then an optional `qbrouter.toml`, then built-in defaults. The merged [`Config`] is checked
//! against guard rails before anything starts; softer problems come back as warnings.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::sources::{ConfigOverrides, DurationSetting, FileConfig};
pub use models::{
    ClientConfig, Config, ConfigMetadata, MigrationSettings, PathsConfig, SyncSettings,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
