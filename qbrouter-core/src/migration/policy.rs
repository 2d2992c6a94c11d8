//! Free-space driven eviction policy.

use super::hardlink::TorrentGroup;

/// Bytes per gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Limits a group must satisfy to be evicted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    /// Aggregate popularity must be strictly below this.
    pub popularity: f64,
    /// Aggregate size in bytes must be strictly above this.
    pub size: u64,
    /// Aggregate seeding time in seconds must be at least this.
    pub seeding_time: u64,
}

impl Thresholds {
    pub fn check(&self, group: &TorrentGroup) -> Option<SkipReason> {
        if group.seeding_time < self.seeding_time {
            return Some(SkipReason::SeedingTime {
                have: group.seeding_time,
                need: self.seeding_time,
            });
        }
        if group.popularity >= self.popularity {
            return Some(SkipReason::Popularity {
                have: group.popularity,
                limit: self.popularity,
            });
        }
        if group.size <= self.size {
            return Some(SkipReason::Size {
                have: group.size,
                limit: self.size,
            });
        }
        None
    }
}

/// Thresholds that apply once free space drops below `below_free_space` bytes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tier {
    pub below_free_space: u64,
    pub thresholds: Thresholds,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyConfig {
    /// Eviction runs only while free space is below this many bytes.
    pub min_free_space: u64,
    /// Floor on every tier's seeding-time threshold, in seconds.
    pub min_seeding_time: u64,
    /// Thresholds above every tier's watermark.
    pub baseline: Thresholds,
    pub tiers: Vec<Tier>,
}

impl Thresholds {
    /// Applies above every tier: evicts almost nothing.
    pub const BASELINE: Thresholds = Thresholds {
        popularity: 0.0,
        size: 20 * GIB,
        seeding_time: 7200,
    };
}

impl Tier {
    pub const LOW: Tier = Tier {
        below_free_space: 20 * GIB,
        thresholds: Thresholds {
            popularity: 0.5,
            size: 10 * GIB,
            seeding_time: 3600,
        },
    };

    pub const CRITICAL: Tier = Tier {
        below_free_space: 10 * GIB,
        thresholds: Thresholds {
            popularity: 50.0,
            size: 0,
            seeding_time: 3600,
        },
    };
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_free_space: 50 * GIB,
            min_seeding_time: 3600,
            baseline: Thresholds::BASELINE,
            tiers: vec![Tier::LOW, Tier::CRITICAL],
        }
    }
}

impl PolicyConfig {
    pub fn needs_eviction(&self, free_space: u64) -> bool {
        free_space < self.min_free_space
    }

    /// Thresholds for the tightest tier whose watermark `free_space` is below, with the
    /// minimum seeding time applied as a floor.
    pub fn thresholds_for(&self, free_space: u64) -> Thresholds {
        let mut thresholds = self
            .tiers
            .iter()
            .filter(|tier| free_space < tier.below_free_space)
            .min_by_key(|tier| tier.below_free_space)
            .map_or(self.baseline, |tier| tier.thresholds);
        thresholds.seeding_time = thresholds.seeding_time.max(self.min_seeding_time);
        thresholds
    }

    /// Order `groups` for eviction and split them into scheduled and skipped.
    pub fn plan(&self, free_space: u64, mut groups: Vec<TorrentGroup>) -> MigrationPlan {
        let thresholds = self.thresholds_for(free_space);
        sort_for_eviction(&mut groups);

        let mut plan = MigrationPlan {
            free_space,
            thresholds,
            scheduled: Vec::new(),
            skipped: Vec::new(),
        };
        for group in groups {
            match thresholds.check(&group) {
                None => plan.scheduled.push(group),
                Some(reason) => plan.skipped.push((group, reason)),
            }
        }
        plan
    }
}

/// Least popular first; among equals, largest first.
pub fn sort_for_eviction(groups: &mut [TorrentGroup]) {
    groups.sort_by(|a, b| {
        a.popularity
            .total_cmp(&b.popularity)
            .then_with(|| b.size.cmp(&a.size))
    });
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SkipReason {
    SeedingTime { have: u64, need: u64 },
    Popularity { have: f64, limit: f64 },
    Size { have: u64, limit: u64 },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SeedingTime { have, need } => {
                write!(f, "low seeding time of {have}s (needs {need}s)")
            }
            SkipReason::Popularity { have, limit } => {
                write!(f, "popularity {have} not below {limit}")
            }
            SkipReason::Size { have, limit } => write!(f, "size {have} not above {limit}"),
        }
    }
}

/// Groups chosen for eviction this cycle, in eviction order.
#[derive(Clone, Debug, PartialEq)]
pub struct MigrationPlan {
    pub free_space: u64,
    pub thresholds: Thresholds,
    pub scheduled: Vec<TorrentGroup>,
    pub skipped: Vec<(TorrentGroup, SkipReason)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryClient;

    fn group(hash: &str, popularity: f64, size: u64, seeding_time: u64) -> TorrentGroup {
        let mut t = InMemoryClient::torrent(hash, "/downloads");
        t.popularity = popularity;
        t.size = size;
        t.seeding_time = seeding_time;
        TorrentGroup::new(vec![t])
    }

    #[test]
    fn tiers_tighten_as_space_drops() {
        let policy = PolicyConfig::default();

        assert!(!policy.needs_eviction(60 * GIB));
        assert!(policy.needs_eviction(40 * GIB));

        assert_eq!(policy.thresholds_for(40 * GIB), policy.baseline);
        assert_eq!(policy.thresholds_for(15 * GIB).popularity, 0.5);
        assert_eq!(
            policy.thresholds_for(8 * GIB),
            Thresholds {
                popularity: 50.0,
                size: 0,
                seeding_time: 3600,
            }
        );
    }

    #[test]
    fn min_seeding_time_is_a_floor() {
        let policy = PolicyConfig {
            min_seeding_time: 86_400,
            ..PolicyConfig::default()
        };
        assert_eq!(policy.thresholds_for(GIB).seeding_time, 86_400);
    }

    #[test]
    fn critical_tier_selects_small_unpopular_torrent() {
        let policy = PolicyConfig::default();
        let plan = policy.plan(8 * GIB, vec![group("one", 1.0, GIB, 7200)]);
        assert_eq!(plan.scheduled.len(), 1);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn equal_popularity_evicts_largest_first() {
        let policy = PolicyConfig::default();
        let plan = policy.plan(
            5 * GIB,
            vec![group("g1", 0.0, 5 * GIB, 7200), group("g2", 0.0, 30 * GIB, 7200)],
        );
        let order: Vec<&str> = plan.scheduled.iter().map(TorrentGroup::name).collect();
        assert_eq!(order, ["g2", "g1"]);
    }

    #[test]
    fn young_groups_are_skipped_with_reason() {
        let policy = PolicyConfig::default();
        let plan = policy.plan(5 * GIB, vec![group("young", 0.0, GIB, 60)]);
        assert!(plan.scheduled.is_empty());
        assert_eq!(
            plan.skipped[0].1,
            SkipReason::SeedingTime {
                have: 60,
                need: 3600
            }
        );
    }

    #[test]
    fn baseline_keeps_everything_on_hot_storage() {
        let policy = PolicyConfig::default();
        let plan = policy.plan(40 * GIB, vec![group("big", 0.0, 100 * GIB, 1_000_000)]);
        assert!(plan.scheduled.is_empty());
        assert!(matches!(plan.skipped[0].1, SkipReason::Popularity { .. }));
    }
}
