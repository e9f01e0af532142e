//! Retention policy properties over synthetic histories

use chrono::{DateTime, Duration, TimeZone, Utc};
use evostate::hash::{hash_bytes, tree_hash};
use evostate::manifest::ManifestStore;
use evostate::{BackupManifest, RetentionPolicy, RetentionTag, SystemState, VersionHistory};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use tempfile::TempDir;

fn manifest(id: &str, timestamp: DateTime<Utc>) -> BackupManifest {
    let mut files = BTreeMap::new();
    files.insert("state.bin".to_string(), hash_bytes(id.as_bytes()));
    let state = SystemState {
        captured_at: timestamp,
        revision: None,
        config_hashes: BTreeMap::new(),
        missing_configs: Vec::new(),
        file_count: files.len(),
        tree_hash: tree_hash(&files),
        engine_version: evostate::VERSION.to_string(),
        platform: "test/test".to_string(),
    };
    BackupManifest::new(id.to_string(), timestamp, state, files)
}

fn id_for(t: DateTime<Utc>) -> String {
    t.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Deterministic spread of backups: irregular gaps, some days with several
fn synthetic_history(start: DateTime<Utc>, count: usize) -> VersionHistory {
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut t = start;
    let mut history = VersionHistory::new();
    for _ in 0..count {
        seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let gap_minutes = (seed >> 33) % (36 * 60);
        t += Duration::minutes(gap_minutes as i64 + 1);
        history.push(manifest(&id_for(t), t));
    }
    history
}

fn retain(history: &VersionHistory, keep: &std::collections::BTreeSet<String>) -> VersionHistory {
    history
        .iter()
        .filter(|m| keep.contains(m.id()))
        .cloned()
        .collect()
}

fn policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy::new(0, 0, 0),
        RetentionPolicy::new(3, 0, 0),
        RetentionPolicy::new(7, 4, 6),
        RetentionPolicy::new(2, 8, 0),
        RetentionPolicy::new(0, 0, 12),
        RetentionPolicy::new(30, 52, 24),
    ]
}

#[test]
fn ten_consecutive_days_with_three_daily() {
    let first = Utc.with_ymd_and_hms(2025, 5, 1, 6, 0, 0).unwrap();
    let history: VersionHistory = (0..10)
        .map(|d| {
            let t = first + Duration::days(d);
            manifest(&id_for(t), t)
        })
        .collect();
    let now = first + Duration::days(9);

    let decision = RetentionPolicy::new(3, 0, 0).apply(&history, now);

    let expected_keep: Vec<String> = (7..10).map(|d| id_for(first + Duration::days(d))).collect();
    assert_eq!(decision.keep.iter().cloned().collect::<Vec<_>>(), expected_keep);
    assert_eq!(decision.discard.len(), 7);
    for id in &expected_keep {
        assert_eq!(decision.tags[id], RetentionTag::Daily);
    }
}

#[test]
fn ten_days_with_floor_outside_daily_window() {
    let first = Utc.with_ymd_and_hms(2025, 5, 1, 6, 0, 0).unwrap();
    let history: VersionHistory = (0..10)
        .map(|d| {
            let t = first + Duration::days(d);
            manifest(&id_for(t), t)
        })
        .collect();
    // Three days after the last backup nothing is in the daily window
    let now = first + Duration::days(12);

    let decision = RetentionPolicy::new(3, 0, 0).apply(&history, now);
    let latest = id_for(first + Duration::days(9));
    assert_eq!(decision.keep.iter().cloned().collect::<Vec<_>>(), vec![latest.clone()]);
    assert_eq!(decision.tags[&latest], RetentionTag::None);
    assert_eq!(decision.discard.len(), 9);
}

#[test]
fn apply_is_idempotent() {
    let start = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
    let history = synthetic_history(start, 600);
    let latest = history.latest().map(|m| m.timestamp()).unwrap();

    for policy in policies() {
        for now in [latest, latest + Duration::hours(5), latest + Duration::days(45)] {
            let first = policy.apply(&history, now);
            let pruned = retain(&history, &first.keep);
            let second = policy.apply(&pruned, now);

            assert_eq!(second.keep, first.keep, "policy {:?} at {}", policy, now);
            assert!(second.discard.is_empty(), "policy {:?} at {}", policy, now);
            assert_eq!(second.tags, first.tags);
        }
    }
}

#[test]
fn latest_backup_is_never_discarded() {
    let start = Utc.with_ymd_and_hms(2023, 11, 20, 0, 0, 0).unwrap();
    for count in [1, 2, 17, 250] {
        let history = synthetic_history(start, count);
        let latest = history.latest().map(|m| m.id().to_string()).unwrap();
        let latest_time = history.latest().map(|m| m.timestamp()).unwrap();

        for policy in policies() {
            for now in [latest_time, latest_time + Duration::days(400)] {
                let decision = policy.apply(&history, now);
                assert!(decision.keep.contains(&latest));
                assert!(!decision.discard.contains(&latest));
                assert_eq!(decision.keep.len() + decision.discard.len(), history.len());
            }
        }
    }
}

#[test]
fn decision_ignores_insertion_order() {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let history = synthetic_history(start, 200);
    let reversed: VersionHistory = history.iter().rev().cloned().collect();
    let now = history.latest().map(|m| m.timestamp()).unwrap();

    let policy = RetentionPolicy::new(7, 4, 6);
    assert_eq!(policy.apply(&history, now), policy.apply(&reversed, now));
}

#[test]
fn ledger_round_trip_preserves_history() -> evostate::Result<()> {
    let temp_dir = TempDir::new()?;
    let store = ManifestStore::new(temp_dir.path());

    store.save(&VersionHistory::new())?;
    assert_eq!(store.load()?, VersionHistory::new());

    let start = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 0).unwrap();
    let mut history = synthetic_history(start, 40);
    let now = history.latest().map(|m| m.timestamp()).unwrap();
    let decision = RetentionPolicy::new(7, 4, 6).apply(&history, now);
    for (id, tag) in &decision.tags {
        if let Some(m) = history.get_mut(id) {
            m.set_retention_tag(*tag);
        }
    }

    store.save(&history)?;
    let loaded = store.load()?;
    assert_eq!(loaded, history);
    assert_eq!(loaded.ids(), history.ids());
    Ok(())
}
