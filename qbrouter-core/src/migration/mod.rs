//! Tagging replicated torrents and evicting them from the source client under space pressure.
//!
//! Each cycle first tags completed torrents whose files all exist in the destination tree, then,
//! if the source disk is below its free-space watermark, moves hard-link groups of tagged
//! torrents to the destination client until enough space is recovered. The two phases always
//! run in that order and never overlap.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{SortKey, TorrentClient, TorrentQuery};
use crate::error::Result;

mod hardlink;
mod mover;
mod paths;
mod policy;
mod tagging;

pub use hardlink::{TorrentGroup, group_by_hardlinks};
pub use mover::{MoveOutcome, MoveStep, MoveTimeouts, Mover};
pub use paths::PathMapper;
pub use policy::{GIB, MigrationPlan, PolicyConfig, SkipReason, Thresholds, Tier, sort_for_eviction};
pub use tagging::{is_replicated, tag_synced};

const TARGET: &str = "qbrouter::migrate";

/// Tag marking a torrent as fully replicated to the destination tree.
pub const SYNCED_TAG: &str = "synced";

/// Which local tree hard links are checked in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HardlinkRoot {
    Source,
    /// The mirror preserves hard links, so the destination tree shows the same groups.
    #[default]
    Destination,
}

#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// Local path of the source client's default save path.
    pub source_root: PathBuf,
    /// Local path of the destination tree (the mirror of `source_root`).
    pub destination_root: PathBuf,
    pub synced_tag: String,
    /// Pause between cycles.
    pub sleep: Duration,
    pub hardlink_root: HardlinkRoot,
    pub policy: PolicyConfig,
    pub timeouts: MoveTimeouts,
    /// Log decisions without tagging or moving anything.
    pub dry_run: bool,
}

impl MigrationConfig {
    pub fn new(source_root: impl Into<PathBuf>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            destination_root: destination_root.into(),
            synced_tag: SYNCED_TAG.to_string(),
            sleep: Duration::from_secs(30),
            hardlink_root: HardlinkRoot::default(),
            policy: PolicyConfig::default(),
            timeouts: MoveTimeouts::default(),
            dry_run: false,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub tagged: Vec<String>,
    /// Source free space when the eviction phase started.
    pub free_space: Option<u64>,
    pub plan: Option<MigrationPlan>,
    pub moves: Vec<(String, MoveOutcome)>,
}

pub struct MigrationEngine {
    source: Arc<dyn TorrentClient>,
    dest: Arc<dyn TorrentClient>,
    config: MigrationConfig,
}

impl fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("source", &self.source.label())
            .field("dest", &self.dest.label())
            .field("config", &self.config)
            .finish()
    }
}

impl MigrationEngine {
    pub fn new(
        source: Arc<dyn TorrentClient>,
        dest: Arc<dyn TorrentClient>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source,
            dest,
            config,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Run cycles until `cancel` fires. A cycle in progress finishes its current torrent first.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(target: TARGET, dry_run = self.config.dry_run, "starting migration engine");
        while !cancel.is_cancelled() {
            self.run_cycle(&cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.sleep) => {}
            }
        }
        info!(target: TARGET, "migration engine stopped");
    }

    /// One tag phase followed by one eviction phase. Failures are logged, never returned.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        match self.tag_phase().await {
            Ok(tagged) => report.tagged = tagged,
            Err(err) => error!(target: TARGET, error = %err, "tag phase failed"),
        }

        if cancel.is_cancelled() {
            return report;
        }

        if let Err(err) = self.evict_phase(cancel, &mut report).await {
            error!(target: TARGET, error = %err, "eviction phase failed");
        }
        report
    }

    async fn tag_phase(&self) -> Result<Vec<String>> {
        let save_path = self.source.default_save_path().await?;
        let mapper = PathMapper::new(save_path, &self.config.destination_root);
        tag_synced(
            self.source.as_ref(),
            &mapper,
            &self.config.synced_tag,
            self.config.dry_run,
        )
        .await
    }

    async fn evict_phase(&self, cancel: &CancellationToken, report: &mut CycleReport) -> Result<()> {
        let policy = &self.config.policy;
        let dry_run = self.config.dry_run;

        let free_space = self.source.free_space().await?;
        report.free_space = Some(free_space);
        if !policy.needs_eviction(free_space) {
            debug!(target: TARGET, free_space, "free space above watermark");
            return Ok(());
        }
        info!(
            target: TARGET,
            free_gib = free_space as f64 / GIB as f64,
            destination = self.dest.label(),
            "low disk space, attempting to move torrents"
        );

        let groups = self.synced_groups().await?;
        let plan = policy.plan(free_space, groups);
        info!(
            target: TARGET,
            popularity = plan.thresholds.popularity,
            size = plan.thresholds.size,
            seeding_time = plan.thresholds.seeding_time,
            scheduled = plan.scheduled.len(),
            skipped = plan.skipped.len(),
            "eviction plan"
        );
        for (group, reason) in &plan.skipped {
            info!(target: TARGET, group = group.name(), %reason, "skipping torrent group");
        }

        let mover = Mover::new(
            self.source.as_ref(),
            self.dest.as_ref(),
            self.config.timeouts,
            cancel,
        );
        let mut projected = free_space;

        for group in &plan.scheduled {
            if cancel.is_cancelled() {
                break;
            }
            info!(
                target: TARGET,
                dry_run,
                group = group.name(),
                members = group.members.len(),
                popularity = group.popularity,
                size = group.size,
                seeding_time = group.seeding_time,
                "migrating torrent group"
            );

            let free_now = if dry_run {
                // Hard-linked members share their data, so the group frees its largest member.
                projected = projected.saturating_add(group.size);
                projected
            } else {
                for member in &group.members {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let outcome = mover.migrate(member).await;
                    report.moves.push((member.hash.clone(), outcome));
                }
                match self.source.free_space().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(target: TARGET, error = %err, "cannot re-check free space, ending cycle");
                        break;
                    }
                }
            };

            if !policy.needs_eviction(free_now) {
                info!(target: TARGET, dry_run, free_space = free_now, "free space recovered");
                break;
            }
        }

        report.plan = Some(plan);
        Ok(())
    }

    /// Tagged torrents on the source, grouped by shared hard links.
    async fn synced_groups(&self) -> Result<Vec<TorrentGroup>> {
        let save_path = self.source.default_save_path().await?;
        let local_root = match self.config.hardlink_root {
            HardlinkRoot::Source => &self.config.source_root,
            HardlinkRoot::Destination => &self.config.destination_root,
        };
        let mapper = PathMapper::new(save_path, local_root);

        let query = TorrentQuery::completed()
            .with_tag(self.config.synced_tag.clone())
            .sorted_by(SortKey::Size, false);
        let torrents = self.source.list_torrents(&query).await?;

        let mut candidates = Vec::with_capacity(torrents.len());
        for torrent in torrents {
            let files = match self.source.torrent_files(&torrent.hash).await {
                Ok(files) => files,
                Err(err) => {
                    warn!(target: TARGET, hash = %torrent.hash, error = %err, "cannot list files, skipping");
                    continue;
                }
            };
            let paths = files
                .iter()
                .filter_map(|file| mapper.map(&torrent, file))
                .collect();
            candidates.push((torrent, paths));
        }

        Ok(group_by_hardlinks(candidates).await)
    }
}
