use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use qbrouter_config::ConfigOverrides;
use qbrouter_config::util::{parse_bool, parse_duration};

#[derive(Parser, Debug)]
#[command(
    name = "qbrouter",
    version,
    about = "Mirror a hot torrent tree to cold storage and migrate torrents between qBittorrent instances"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load the configuration, log in to both clients, report their free space and exit
    Check,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Hot tree watched and mirrored (the source client's save path as mounted here)
    #[arg(long = "src", env = "SRC_PATH", global = true)]
    pub src: Option<PathBuf>,

    /// Cold tree receiving the mirror
    #[arg(long = "dest", env = "DEST_PATH", global = true)]
    pub dest: Option<PathBuf>,

    /// WebAPI URL of the hot qBittorrent instance
    #[arg(long, env = "QB_SRC_URL", global = true)]
    pub src_url: Option<String>,

    #[arg(long, env = "QB_SRC_USERNAME", global = true)]
    pub src_username: Option<String>,

    #[arg(long, env = "QB_SRC_PASSWORD", hide_env_values = true, global = true)]
    pub src_password: Option<String>,

    /// WebAPI URL of the cold qBittorrent instance
    #[arg(long, env = "QB_DEST_URL", global = true)]
    pub dest_url: Option<String>,

    #[arg(long, env = "QB_DEST_USERNAME", global = true)]
    pub dest_username: Option<String>,

    #[arg(long, env = "QB_DEST_PASSWORD", hide_env_values = true, global = true)]
    pub dest_password: Option<String>,

    /// Free space (GiB) to keep on the hot disk
    #[arg(long = "min-space", env = "MIN_SPACE", global = true)]
    pub min_space: Option<f64>,

    /// Seeding time a torrent needs before it may be migrated (seconds or e.g. "1h")
    #[arg(long, env = "MIN_SEEDING_TIME", value_parser = parse_duration, global = true)]
    pub min_seeding_time: Option<Duration>,

    /// Pause between migration cycles (seconds or e.g. "5m")
    #[arg(long, env = "SLEEP", value_parser = parse_duration, global = true)]
    pub sleep: Option<Duration>,

    /// Log every decision without copying, tagging or moving anything
    #[arg(
        long,
        env = "DRY_RUN",
        value_parser = bool_arg,
        num_args = 0..=1,
        default_missing_value = "true",
        global = true
    )]
    pub dry_run: Option<bool>,

    /// Path to qbrouter.toml
    #[arg(long, env = "QBROUTER_CONFIG_PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(
        long,
        env = "DEBUG",
        value_parser = bool_arg,
        num_args = 0..=1,
        default_missing_value = "true",
        global = true
    )]
    pub debug: Option<bool>,
}

impl RunArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source_path: self.src.clone(),
            destination_path: self.dest.clone(),
            source_url: self.src_url.clone(),
            source_username: self.src_username.clone(),
            source_password: self.src_password.clone(),
            destination_url: self.dest_url.clone(),
            destination_username: self.dest_username.clone(),
            destination_password: self.dest_password.clone(),
            min_free_space: self.min_space,
            min_seeding_time: self.min_seeding_time,
            sleep: self.sleep,
            dry_run: self.dry_run,
        }
    }

    pub fn debug(&self) -> bool {
        self.debug.unwrap_or(false)
    }
}

fn bool_arg(raw: &str) -> Result<bool, String> {
    parse_bool(raw).ok_or_else(|| format!("expected true/false, yes/no, on/off or 1/0, got `{raw}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_fill_overrides() {
        let cli = Cli::try_parse_from([
            "qbrouter",
            "--src",
            "/data/hot",
            "--dest",
            "/data/cold",
            "--min-space",
            "25.5",
            "--sleep",
            "90",
            "--min-seeding-time",
            "2h",
            "--dry-run",
        ])
        .unwrap();

        let overrides = cli.run.overrides();
        assert_eq!(overrides.source_path, Some(PathBuf::from("/data/hot")));
        assert_eq!(overrides.destination_path, Some(PathBuf::from("/data/cold")));
        assert_eq!(overrides.min_free_space, Some(25.5));
        assert_eq!(overrides.sleep, Some(Duration::from_secs(90)));
        assert_eq!(overrides.min_seeding_time, Some(Duration::from_secs(7200)));
        assert_eq!(overrides.dry_run, Some(true));
        assert!(cli.command.is_none());
    }

    #[test]
    fn check_subcommand_accepts_shared_flags() {
        let cli = Cli::try_parse_from(["qbrouter", "check", "--dry-run", "off"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Check)));
        assert_eq!(cli.run.dry_run, Some(false));
    }

    #[test]
    fn bad_durations_are_rejected() {
        assert!(Cli::try_parse_from(["qbrouter", "--sleep", "soonish"]).is_err());
    }
}
