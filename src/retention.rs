//! Tiered retention policy
//!
//! Buckets backups by calendar day, ISO week and month relative to `now`
//! (UTC) and keeps the earliest backup of each bucket inside each tier's
//! window. The decision is pure: deleting discarded backups is up to the
//! caller.
//!
//! Re-applying the policy to the kept set with the same `now` keeps every
//! backup again. Each bucket's pick is the earliest member of its bucket and
//! survives pruning, so it is still the earliest afterwards.

use crate::manifest::{BackupManifest, RetentionTag, VersionHistory};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Number of buckets each tier retains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Calendar days, counting today
    pub daily: u32,
    /// ISO weeks (Monday start), counting the current week
    pub weekly: u32,
    /// Calendar months, counting the current month
    pub monthly: u32,
}

/// Outcome of applying a policy to a history
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionDecision {
    pub keep: BTreeSet<String>,
    pub discard: BTreeSet<String>,
    /// Finest tier that selected each kept backup
    pub tags: BTreeMap<String, RetentionTag>,
}

impl RetentionPolicy {
    pub fn new(daily: u32, weekly: u32, monthly: u32) -> Self {
        Self {
            daily,
            weekly,
            monthly,
        }
    }

    /// Decide which backups to keep and which to discard
    pub fn apply(&self, history: &VersionHistory, now: DateTime<Utc>) -> RetentionDecision {
        let mut ordered: Vec<&BackupManifest> = history.iter().collect();
        ordered.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.id().cmp(b.id()))
        });

        let today = now.date_naive();
        let mut daily: BTreeMap<NaiveDate, &str> = BTreeMap::new();
        let mut weekly: BTreeMap<NaiveDate, &str> = BTreeMap::new();
        let mut monthly: BTreeMap<(i32, u32), &str> = BTreeMap::new();
        let mut future: Vec<&str> = Vec::new();

        // `ordered` is ascending, so the first entry per bucket is the earliest
        for manifest in &ordered {
            if manifest.timestamp() > now {
                future.push(manifest.id());
                continue;
            }

            let date = manifest.timestamp().date_naive();
            let day_offset = (today - date).num_days();
            let in_daily_window = day_offset < i64::from(self.daily);
            if in_daily_window {
                daily.entry(date).or_insert(manifest.id());
            }

            let week = week_start(date);
            let week_offset = (week_start(today) - week).num_days() / 7;
            if week_offset < i64::from(self.weekly) && !in_daily_window {
                weekly.entry(week).or_insert(manifest.id());
            }

            let month_offset = month_index(today) - month_index(date);
            if month_offset < i64::from(self.monthly) {
                monthly
                    .entry((date.year(), date.month()))
                    .or_insert(manifest.id());
            }
        }

        let mut tags: BTreeMap<String, RetentionTag> = BTreeMap::new();
        // Coarse to fine so the finest tier's tag wins
        for id in monthly.values() {
            tags.insert(id.to_string(), RetentionTag::Monthly);
        }
        for id in weekly.values() {
            tags.insert(id.to_string(), RetentionTag::Weekly);
        }
        for id in daily.values() {
            tags.insert(id.to_string(), RetentionTag::Daily);
        }
        for id in future {
            tags.entry(id.to_string()).or_insert(RetentionTag::None);
        }

        // Safety floor: the most recent backup always survives
        if let Some(latest) = history.latest() {
            tags.entry(latest.id().to_string())
                .or_insert(RetentionTag::None);
        }

        let keep: BTreeSet<String> = tags.keys().cloned().collect();
        let discard: BTreeSet<String> = history
            .iter()
            .map(|m| m.id().to_string())
            .filter(|id| !keep.contains(id))
            .collect();

        debug!(
            "Retention decision: keep {}, discard {} (daily {}, weekly {}, monthly {})",
            keep.len(),
            discard.len(),
            daily.len(),
            weekly.len(),
            monthly.len()
        );

        RetentionDecision {
            keep,
            discard,
            tags,
        }
    }
}

/// Monday of the ISO week containing `date`
fn week_start(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}
