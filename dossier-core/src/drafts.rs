//! Versioned draft store.
//!
//! After every stage the orchestrator writes a full snapshot of the research
//! state:
//!
//! ```text
//! <root>/<run_id>/001_planner.snapshot
//! <root>/<run_id>/002_researcher.snapshot
//! <root>/<run_id>/summary
//! ```
//!
//! Snapshots are pretty-printed JSON. `summary` is a JSON array of every
//! [`DraftRecord`] of the run in order and is rewritten atomically after each
//! append, so it never lists a snapshot that is not on disk.

use crate::error::DraftError;
use crate::persistence::{atomic_write, atomic_write_json, load_json};
use crate::state::ResearchState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const SUMMARY_FILE: &str = "summary";

/// One immutable entry of a run's draft history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub stage_name: String,
    /// 1-based, contiguous within a run.
    pub sequence_number: u32,
    pub timestamp: DateTime<Utc>,
    pub snapshot_path: PathBuf,
}

/// Filesystem-backed store of per-run snapshots.
#[derive(Debug, Clone)]
pub struct DraftStore {
    root: PathBuf,
}

impl DraftStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Append a snapshot of `state` taken after `stage_name`.
    pub fn record(
        &self,
        run_id: Uuid,
        stage_name: &str,
        state: &ResearchState,
    ) -> Result<DraftRecord, DraftError> {
        let dir = self.run_dir(run_id);
        let mut records = self.list(run_id)?;
        let sequence_number = records.last().map_or(1, |r| r.sequence_number + 1);
        let snapshot_path = dir.join(format!("{sequence_number:03}_{stage_name}.snapshot"));

        let json = serde_json::to_string_pretty(state).map_err(|e| DraftError::Persistence {
            message: format!("failed to serialize state: {e}"),
        })?;
        atomic_write(&snapshot_path, json.as_bytes())?;

        let record = DraftRecord {
            stage_name: stage_name.to_string(),
            sequence_number,
            timestamp: Utc::now(),
            snapshot_path,
        };
        records.push(record.clone());
        atomic_write_json(&dir.join(SUMMARY_FILE), &records)?;

        debug!(
            run_id = %run_id,
            stage = stage_name,
            sequence = sequence_number,
            "Draft recorded"
        );
        Ok(record)
    }

    /// Every record of a run in order; empty for an unknown run.
    pub fn list(&self, run_id: Uuid) -> Result<Vec<DraftRecord>, DraftError> {
        let path = self.run_dir(run_id).join(SUMMARY_FILE);
        Ok(load_json(&path)?.unwrap_or_default())
    }

    pub fn latest(&self, run_id: Uuid) -> Result<DraftRecord, DraftError> {
        self.list(run_id)?
            .pop()
            .ok_or(DraftError::NoDrafts { run_id })
    }

    pub fn load(&self, record: &DraftRecord) -> Result<ResearchState, DraftError> {
        load_json(&record.snapshot_path)?.ok_or_else(|| DraftError::SnapshotMissing {
            path: record.snapshot_path.clone(),
        })
    }

    /// The newest record of a run and the state it captured.
    pub fn load_latest(&self, run_id: Uuid) -> Result<(DraftRecord, ResearchState), DraftError> {
        let record = self.latest(run_id)?;
        let state = self.load(&record)?;
        Ok((record, state))
    }

    /// Runs with at least one recorded draft.
    pub fn runs(&self) -> Result<Vec<Uuid>, DraftError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            if entry.path().join(SUMMARY_FILE).exists() {
                runs.push(id);
            }
        }
        runs.sort();
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateDelta, Tone};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn state() -> ResearchState {
        ResearchState::new("renewable energy trends", Tone::Objective, "en", vec![])
    }

    #[test]
    fn test_record_layout() {
        let dir = TempDir::new().unwrap();
        let store = DraftStore::new(dir.path());
        let run_id = Uuid::new_v4();

        let first = store.record(run_id, "planner", &state()).unwrap();
        let second = store.record(run_id, "researcher", &state()).unwrap();

        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
        assert!(first.snapshot_path.ends_with("001_planner.snapshot"));
        assert!(second.snapshot_path.ends_with("002_researcher.snapshot"));
        assert!(store.run_dir(run_id).join("summary").exists());
        assert!(!store.run_dir(run_id).join("summary.tmp").exists());
    }

    #[test]
    fn test_summary_lists_records_in_order() {
        let dir = TempDir::new().unwrap();
        let store = DraftStore::new(dir.path());
        let run_id = Uuid::new_v4();
        for stage in ["planner", "researcher", "writer"] {
            store.record(run_id, stage, &state()).unwrap();
        }
        let names: Vec<String> = store
            .list(run_id)
            .unwrap()
            .into_iter()
            .map(|r| r.stage_name)
            .collect();
        assert_eq!(names, vec!["planner", "researcher", "writer"]);

        let raw = std::fs::read_to_string(store.run_dir(run_id).join("summary")).unwrap();
        let parsed: Vec<DraftRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = DraftStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let mut state = state();
        state.apply(&StateDelta::new().with_draft_report("# Draft\n"));
        store.record(run_id, "writer", &state).unwrap();

        let (record, loaded) = store.load_latest(run_id).unwrap();
        assert_eq!(record.stage_name, "writer");
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_unknown_run() {
        let dir = TempDir::new().unwrap();
        let store = DraftStore::new(dir.path());
        let run_id = Uuid::new_v4();
        assert!(store.list(run_id).unwrap().is_empty());
        assert!(matches!(
            store.latest(run_id),
            Err(DraftError::NoDrafts { .. })
        ));
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = DraftStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let record = store.record(run_id, "planner", &state()).unwrap();
        std::fs::remove_file(&record.snapshot_path).unwrap();
        assert!(matches!(
            store.load(&record),
            Err(DraftError::SnapshotMissing { .. })
        ));
    }

    #[test]
    fn test_runs_lists_only_run_dirs() {
        let dir = TempDir::new().unwrap();
        let store = DraftStore::new(dir.path());
        assert!(store.runs().unwrap().is_empty());

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.record(a, "planner", &state()).unwrap();
        store.record(b, "planner", &state()).unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-run")).unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.runs().unwrap(), expected);
    }
}
