//! Durable per-task progress. One JSON document, rewritten atomically on
//! every task transition.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{CopyTask, TaskKey, TaskStatus};
use crate::provider::JobHandle;
use crate::workspace::{read_json, write_json};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub source_arn: String,
    pub destination_vault: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub job_handle: Option<JobHandle>,
    #[serde(default)]
    pub destination_recovery_point_arn: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// The planned copy. Verification reads it back after the task has left
    /// the plan.
    #[serde(default)]
    pub task: Option<CopyTask>,
}

impl TaskRecord {
    pub fn new(key: &TaskKey, status: TaskStatus) -> Self {
        Self {
            source_arn: key.source_arn.clone(),
            destination_vault: key.destination_vault.clone(),
            status,
            attempt_count: 0,
            last_error: None,
            job_handle: None,
            destination_recovery_point_arn: None,
            updated_at: Utc::now(),
            task: None,
        }
    }

    pub fn for_task(task: &CopyTask, status: TaskStatus) -> Self {
        Self {
            task: Some(task.clone()),
            ..Self::new(&task.key, status)
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.source_arn, &self.destination_vault)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointState {
    pub version: u32,
    pub plan_fingerprint: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Keyed by `TaskKey::encode`.
    pub tasks: BTreeMap<String, TaskRecord>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            plan_fingerprint: None,
            updated_at: None,
            tasks: BTreeMap::new(),
        }
    }
}

impl CheckpointState {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|r| r.status == status).count()
    }

    /// Every SUCCEEDED task that carries its planned copy, oldest first.
    pub fn succeeded_tasks(&self) -> Vec<CopyTask> {
        let mut out: Vec<CopyTask> = self
            .tasks
            .values()
            .filter(|r| r.status == TaskStatus::Succeeded)
            .filter_map(|r| r.task.clone())
            .map(|mut t| {
                t.status = TaskStatus::Succeeded;
                t.reason = None;
                t
            })
            .collect();
        out.sort_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then_with(|| a.key.cmp(&b.key))
        });
        out
    }

    /// Destination point arn -> source arn for every confirmed copy.
    pub fn copy_markers(&self) -> BTreeMap<String, String> {
        self.tasks
            .values()
            .filter(|r| r.status == TaskStatus::Succeeded)
            .filter_map(|r| {
                r.destination_recovery_point_arn
                    .as_ref()
                    .map(|d| (d.clone(), r.source_arn.clone()))
            })
            .collect()
    }
}

pub fn load_state(path: &Path) -> Result<CheckpointState> {
    let state: CheckpointState = read_json(path)?.unwrap_or_default();
    if state.version > CHECKPOINT_VERSION {
        return Err(Error::msg(format!(
            "checkpoint {} has version {} (this build understands up to {CHECKPOINT_VERSION})",
            path.display(),
            state.version
        )));
    }
    Ok(state)
}

pub struct CheckpointStore {
    // `None` keeps everything in memory (dry runs).
    path: Option<PathBuf>,
    state: CheckpointState,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        let state = load_state(path)?;
        debug!(path = %path.display(), tasks = state.tasks.len(), "checkpoint loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            state,
        })
    }

    pub fn ephemeral() -> Self {
        Self {
            path: None,
            state: CheckpointState::default(),
        }
    }

    /// Prior progress without ever writing back.
    pub fn load_ephemeral(path: &Path) -> Result<Self> {
        Ok(Self {
            path: None,
            state: load_state(path)?,
        })
    }

    pub fn is_durable(&self) -> bool {
        self.path.is_some()
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn get(&self, key: &TaskKey) -> Option<&TaskRecord> {
        self.state.tasks.get(&key.encode())
    }

    pub fn set_fingerprint(&mut self, fingerprint: &str) -> Result<()> {
        if self.state.plan_fingerprint.as_deref() == Some(fingerprint) {
            return Ok(());
        }
        let mut next = self.state.clone();
        next.plan_fingerprint = Some(fingerprint.to_string());
        self.commit(next)
    }

    /// Persist one task transition. A SUCCEEDED record never moves back.
    pub fn record(&mut self, mut rec: TaskRecord) -> Result<()> {
        let key = rec.key().encode();
        if let Some(prev) = self.state.tasks.get(&key)
            && prev.status == TaskStatus::Succeeded
            && rec.status != TaskStatus::Succeeded
        {
            return Err(Error::msg(format!(
                "refusing to move {} from SUCCEEDED to {}",
                rec.key(),
                rec.status
            )));
        }
        rec.updated_at = Utc::now();
        let mut next = self.state.clone();
        next.tasks.insert(key, rec);
        self.commit(next)
    }

    /// Several transitions in one write. Same regression rule as `record`.
    pub fn record_many(&mut self, recs: Vec<TaskRecord>) -> Result<()> {
        if recs.is_empty() {
            return Ok(());
        }
        let mut next = self.state.clone();
        let now = Utc::now();
        for mut rec in recs {
            let key = rec.key().encode();
            if let Some(prev) = next.tasks.get(&key)
                && prev.status == TaskStatus::Succeeded
                && rec.status != TaskStatus::Succeeded
            {
                return Err(Error::msg(format!(
                    "refusing to move {} from SUCCEEDED to {}",
                    rec.key(),
                    rec.status
                )));
            }
            rec.updated_at = now;
            next.tasks.insert(key, rec);
        }
        self.commit(next)
    }

    /// Forget all progress (`copy --fresh`).
    pub fn reset(&mut self) -> Result<()> {
        self.commit(CheckpointState::default())
    }

    // The in-memory state only advances once the write landed.
    fn commit(&mut self, mut next: CheckpointState) -> Result<()> {
        next.version = CHECKPOINT_VERSION;
        next.updated_at = Some(Utc::now());
        if let Some(path) = &self.path {
            write_json(path, &next).map_err(|e| e.context("checkpoint write failed"))?;
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> TaskKey {
        TaskKey::new(
            format!("arn:aws:backup:us-east-1:111111111111:recovery-point:{n}"),
            "dr",
        )
    }

    #[test]
    fn records_survive_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("checkpoint.json");
        {
            let mut store = CheckpointStore::open(&path).expect("open");
            let mut rec = TaskRecord::new(&key(1), TaskStatus::InProgress);
            rec.attempt_count = 1;
            rec.job_handle = Some(JobHandle {
                job_id: "job-1".into(),
                account: "111111111111".into(),
                region: "us-east-1".into(),
            });
            store.record(rec).expect("record");
        }
        let store = CheckpointStore::open(&path).expect("reopen");
        let rec = store.get(&key(1)).expect("record present");
        assert_eq!(rec.status, TaskStatus::InProgress);
        assert_eq!(rec.job_handle.as_ref().unwrap().job_id, "job-1");
    }

    #[test]
    fn succeeded_does_not_regress() {
        let mut store = CheckpointStore::ephemeral();
        store
            .record(TaskRecord::new(&key(1), TaskStatus::Succeeded))
            .unwrap();
        let err = store
            .record(TaskRecord::new(&key(1), TaskStatus::Pending))
            .unwrap_err();
        assert!(err.to_string().contains("refusing"));
        assert_eq!(store.get(&key(1)).unwrap().status, TaskStatus::Succeeded);
    }

    #[test]
    fn unknown_fields_are_ignored_on_load() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("checkpoint.json");
        let raw = r#"{
            "version": 1,
            "future_field": {"x": 1},
            "tasks": {
                "arn:a|dr": {
                    "source_arn": "arn:a",
                    "destination_vault": "dr",
                    "status": "FAILED",
                    "attempt_count": 4,
                    "last_error": "AccessDenied",
                    "updated_at": "2025-01-01T00:00:00Z",
                    "extra": true
                }
            }
        }"#;
        std::fs::write(&path, raw).unwrap();
        let state = load_state(&path).expect("load");
        assert_eq!(state.count(TaskStatus::Failed), 1);
        assert_eq!(state.tasks["arn:a|dr"].attempt_count, 4);
    }

    #[test]
    fn newer_versions_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("checkpoint.json");
        std::fs::write(&path, r#"{"version": 99}"#).unwrap();
        assert!(load_state(&path).is_err());
    }

    #[test]
    fn ephemeral_store_never_writes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("checkpoint.json");
        let mut store = CheckpointStore::load_ephemeral(&path).expect("load");
        store
            .record(TaskRecord::new(&key(1), TaskStatus::Skipped))
            .unwrap();
        assert!(!path.exists());
        assert!(!store.is_durable());
    }

    #[test]
    fn markers_come_from_succeeded_records() {
        let mut store = CheckpointStore::ephemeral();
        let mut ok = TaskRecord::new(&key(1), TaskStatus::Succeeded);
        ok.destination_recovery_point_arn = Some("arn:dest:1".into());
        store.record(ok).unwrap();
        let mut failed = TaskRecord::new(&key(2), TaskStatus::Failed);
        failed.destination_recovery_point_arn = Some("arn:dest:2".into());
        store.record(failed).unwrap();

        let markers = store.state().copy_markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers["arn:dest:1"], key(1).source_arn);
    }

    fn planned(n: u32) -> CopyTask {
        use chrono::TimeZone;
        CopyTask {
            key: key(n),
            source_account: "111111111111".into(),
            source_region: "us-east-1".into(),
            source_vault: "daily".into(),
            resource_arn: format!("arn:aws:ec2:us-east-1:111111111111:volume/vol-{n}"),
            resource_type: "EBS".into(),
            creation_time: Utc.with_ymd_and_hms(2025, 1, n, 0, 0, 0).unwrap(),
            backup_size_bytes: Some(u64::from(n)),
            checksum: None,
            destination_account: "222222222222".into(),
            destination_region: "us-east-1".into(),
            destination_vault_arn: "arn:aws:backup:us-east-1:222222222222:backup-vault:dr".into(),
            status: TaskStatus::Pending,
            reason: None,
        }
    }

    #[test]
    fn succeeded_tasks_survive_reopen_with_their_metadata() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("checkpoint.json");
        {
            let mut store = CheckpointStore::open(&path).expect("open");
            store
                .record_many(vec![
                    TaskRecord::for_task(&planned(2), TaskStatus::Succeeded),
                    TaskRecord::for_task(&planned(1), TaskStatus::Succeeded),
                    TaskRecord::for_task(&planned(3), TaskStatus::InProgress),
                    // Written before records carried their task.
                    TaskRecord::new(&key(4), TaskStatus::Succeeded),
                ])
                .expect("record");
        }
        let state = load_state(&path).expect("load");
        let done = state.succeeded_tasks();
        let keys: Vec<TaskKey> = done.iter().map(|t| t.key.clone()).collect();
        assert_eq!(keys, [key(1), key(2)]);
        assert!(done.iter().all(|t| t.status == TaskStatus::Succeeded));
        assert_eq!(done[1].backup_size_bytes, Some(2));
    }
}
