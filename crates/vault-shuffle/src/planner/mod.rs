use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{MigrationConfig, VaultTarget};
use crate::error::{Error, Result};
use crate::inventory::InventorySnapshot;
use crate::model::{CopyTask, RecoveryPoint, TaskKey, TaskStatus, VaultContents};

/// A source point that will not be copied, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub source_arn: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub created_at: DateTime<Utc>,
    pub source_account: String,
    pub destination_account: String,
    /// Oldest source point first, ties by arn.
    pub tasks: Vec<CopyTask>,
    #[serde(default)]
    pub excluded: Vec<Exclusion>,
    /// Source points that already have an equivalent at the destination.
    #[serde(default)]
    pub already_present: usize,
    /// Task key (`TaskKey::encode`) -> the destination point standing for it,
    /// for every source counted in `already_present`.
    #[serde(default)]
    pub present: BTreeMap<String, String>,
}

impl MigrationPlan {
    /// Stable identity of the task set, recorded in the checkpoint.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        for t in &self.tasks {
            h.update(t.key.encode().as_bytes());
            h.update(b"\n");
        }
        hex::encode(h.finalize())
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn get(&self, key: &TaskKey) -> Option<&CopyTask> {
        self.tasks.iter().find(|t| &t.key == key)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Whether `dest` already stands for `source` at the destination.
///
/// A copy-source marker naming the source wins outright. Otherwise resource
/// arn and creation time must agree, and so must checksums when both sides
/// report one. Points being expired or deleted never count.
pub fn is_equivalent(source: &RecoveryPoint, dest: &RecoveryPoint) -> bool {
    if !dest.status.is_live() {
        return false;
    }
    if dest.copy_source_arn.as_deref() == Some(source.arn.as_str()) {
        return true;
    }
    if source.resource_arn.is_empty()
        || source.resource_arn != dest.resource_arn
        || source.creation_time != dest.creation_time
    {
        return false;
    }
    match (&source.checksum, &dest.checksum) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

enum Presence {
    Missing,
    Present(String),
    Ambiguous(usize),
}

fn presence(source: &RecoveryPoint, dest: Option<&VaultContents>) -> Presence {
    let Some(dest) = dest else {
        return Presence::Missing;
    };
    let candidates: Vec<&RecoveryPoint> = dest
        .recovery_points
        .iter()
        .filter(|d| is_equivalent(source, d))
        .collect();
    if let [only] = candidates.as_slice() {
        return Presence::Present(only.arn.clone());
    }
    let marked = candidates
        .iter()
        .find(|d| d.copy_source_arn.as_deref() == Some(source.arn.as_str()));
    match (candidates.len(), marked) {
        (0, _) => Presence::Missing,
        (n, Some(d)) => {
            debug!(source = %source.arn, candidates = n, "marker breaks tie");
            Presence::Present(d.arn.clone())
        }
        (n, None) => Presence::Ambiguous(n),
    }
}

pub struct Planner {
    destination_account: String,
    mapping: BTreeMap<String, VaultTarget>,
}

impl Planner {
    pub fn new(destination_account: impl Into<String>, mapping: BTreeMap<String, VaultTarget>) -> Self {
        Self {
            destination_account: destination_account.into(),
            mapping,
        }
    }

    pub fn from_config(cfg: &MigrationConfig) -> Self {
        Self::new(cfg.destination_account.clone(), cfg.vault_mapping.clone())
    }

    /// Diff `source` against `dest`. Fails before anything is planned when a
    /// mapped destination vault does not exist, or when its region could not
    /// be scanned.
    pub fn plan(&self, source: &InventorySnapshot, dest: &InventorySnapshot) -> Result<MigrationPlan> {
        let mut tasks: Vec<CopyTask> = Vec::new();
        let mut keys: BTreeSet<TaskKey> = BTreeSet::new();
        let mut excluded: Vec<Exclusion> = Vec::new();
        let mut present: BTreeMap<String, String> = BTreeMap::new();
        let mut source_account = String::new();

        for name in self.mapping.keys() {
            if !source.vaults.iter().any(|c| &c.vault.name == name) {
                warn!(vault = %name, "mapped source vault not found in source inventory");
            }
        }

        for contents in &source.vaults {
            let vault = &contents.vault;
            if source_account.is_empty() {
                source_account = vault.account_id.clone();
            }
            let Some(target) = self.mapping.get(&vault.name) else {
                for rp in &contents.recovery_points {
                    excluded.push(Exclusion {
                        source_arn: rp.arn.clone(),
                        reason: format!("vault '{}' has no mapping", vault.name),
                    });
                }
                continue;
            };

            let dest_region = target.region().unwrap_or(&vault.region);
            let dest_name = target.vault();
            if let Some(f) = dest.pair_failure(&self.destination_account, dest_region) {
                return Err(Error::msg(format!(
                    "destination {}/{dest_region} could not be scanned ({}); refusing to plan copies into it",
                    self.destination_account, f.reason
                )));
            }
            if !dest.pair_scanned(&self.destination_account, dest_region) {
                return Err(Error::msg(format!(
                    "destination {}/{dest_region} was not part of the destination scan",
                    self.destination_account
                )));
            }
            let Some(dest_vault) = dest.find_vault(&self.destination_account, dest_region, dest_name)
            else {
                return Err(Error::config(format!(
                    "destination vault '{dest_name}' (mapped from '{}') does not exist in {}/{dest_region}",
                    vault.name, self.destination_account
                )));
            };

            for rp in &contents.recovery_points {
                if !rp.is_completed() {
                    excluded.push(Exclusion {
                        source_arn: rp.arn.clone(),
                        reason: format!("status {}", rp.status),
                    });
                    continue;
                }
                let key = TaskKey::new(&rp.arn, dest_name);
                if !keys.insert(key.clone()) {
                    continue;
                }
                let (status, reason) = match presence(rp, Some(dest_vault)) {
                    Presence::Present(dest_arn) => {
                        present.insert(key.encode(), dest_arn);
                        continue;
                    }
                    Presence::Missing => (TaskStatus::Pending, None),
                    Presence::Ambiguous(n) => (
                        TaskStatus::Skipped,
                        Some(format!("ambiguous: {n} destination candidates")),
                    ),
                };
                tasks.push(CopyTask {
                    key,
                    source_account: rp.account_id.clone(),
                    source_region: rp.region.clone(),
                    source_vault: vault.name.clone(),
                    resource_arn: rp.resource_arn.clone(),
                    resource_type: rp.resource_type.clone(),
                    creation_time: rp.creation_time,
                    backup_size_bytes: rp.backup_size_bytes,
                    checksum: rp.checksum.clone(),
                    destination_account: self.destination_account.clone(),
                    destination_region: dest_region.to_string(),
                    destination_vault_arn: dest_vault.vault.arn.clone(),
                    status,
                    reason,
                });
            }
        }

        tasks.sort_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then_with(|| a.key.cmp(&b.key))
        });

        let plan = MigrationPlan {
            created_at: Utc::now(),
            source_account,
            destination_account: self.destination_account.clone(),
            tasks,
            excluded,
            already_present: present.len(),
            present,
        };
        info!(
            pending = plan.count(TaskStatus::Pending),
            skipped = plan.count(TaskStatus::Skipped),
            already_present = plan.already_present,
            excluded = plan.excluded.len(),
            "plan computed"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ScannedPair;
    use crate::model::{RecoveryPointStatus, Vault};
    use chrono::TimeZone;

    const SRC: &str = "111111111111";
    const DST: &str = "222222222222";

    fn vault(account: &str, region: &str, name: &str) -> Vault {
        Vault {
            name: name.into(),
            arn: format!("arn:aws:backup:{region}:{account}:backup-vault:{name}"),
            region: region.into(),
            account_id: account.into(),
        }
    }

    fn point(v: &Vault, id: &str, day: u32) -> RecoveryPoint {
        RecoveryPoint {
            arn: format!(
                "arn:aws:backup:{}:{}:recovery-point:{id}",
                v.region, v.account_id
            ),
            vault_name: v.name.clone(),
            region: v.region.clone(),
            account_id: v.account_id.clone(),
            resource_arn: format!("arn:aws:ec2:{}:{SRC}:volume/vol-{id}", v.region),
            resource_type: "EBS".into(),
            creation_time: Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap(),
            completion_time: None,
            status: RecoveryPointStatus::Completed,
            backup_size_bytes: Some(100),
            checksum: None,
            copy_source_arn: None,
        }
    }

    fn snapshot(account: &str, vaults: Vec<VaultContents>) -> InventorySnapshot {
        let mut snap = InventorySnapshot::empty();
        let mut regions: Vec<String> = vaults.iter().map(|c| c.vault.region.clone()).collect();
        regions.push("us-east-1".into());
        regions.dedup();
        for r in regions {
            snap.scanned.push(ScannedPair {
                account: account.into(),
                region: r,
                vaults: 0,
                recovery_points: 0,
            });
        }
        snap.vaults = vaults;
        snap
    }

    fn mapping(src: &str, dst: &str) -> BTreeMap<String, VaultTarget> {
        let mut m = BTreeMap::new();
        m.insert(src.to_string(), VaultTarget::Name(dst.to_string()));
        m
    }

    #[test]
    fn missing_points_are_planned_oldest_first() {
        let sv = vault(SRC, "us-east-1", "daily");
        let dv = vault(DST, "us-east-1", "dr");
        let source = snapshot(
            SRC,
            vec![VaultContents {
                vault: sv.clone(),
                recovery_points: vec![point(&sv, "c", 3), point(&sv, "a", 1), point(&sv, "b", 2)],
            }],
        );
        let dest = snapshot(
            DST,
            vec![VaultContents {
                vault: dv,
                recovery_points: vec![],
            }],
        );
        let plan = Planner::new(DST, mapping("daily", "dr"))
            .plan(&source, &dest)
            .unwrap();
        let ids: Vec<&str> = plan
            .tasks
            .iter()
            .map(|t| t.source_arn().rsplit(':').next().unwrap())
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(plan.tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn present_points_are_not_replanned() {
        let sv = vault(SRC, "us-east-1", "daily");
        let dv = vault(DST, "us-east-1", "dr");
        let a = point(&sv, "a", 1);
        let mut copied = point(&dv, "copy-a", 1);
        copied.resource_arn = a.resource_arn.clone();
        let copy_arn = copied.arn.clone();
        let a_key = TaskKey::new(&a.arn, "dr").encode();
        let source = snapshot(
            SRC,
            vec![VaultContents {
                vault: sv.clone(),
                recovery_points: vec![a, point(&sv, "b", 2)],
            }],
        );
        let dest = snapshot(
            DST,
            vec![VaultContents {
                vault: dv,
                recovery_points: vec![copied],
            }],
        );
        let plan = Planner::new(DST, mapping("daily", "dr"))
            .plan(&source, &dest)
            .unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.already_present, 1);
        assert_eq!(plan.present.get(&a_key), Some(&copy_arn));
    }

    #[test]
    fn two_unmarked_matches_are_ambiguous() {
        let sv = vault(SRC, "us-east-1", "daily");
        let dv = vault(DST, "us-east-1", "dr");
        let a = point(&sv, "a", 1);
        let mut d1 = point(&dv, "d1", 1);
        d1.resource_arn = a.resource_arn.clone();
        let mut d2 = point(&dv, "d2", 1);
        d2.resource_arn = a.resource_arn.clone();
        let source = snapshot(
            SRC,
            vec![VaultContents {
                vault: sv.clone(),
                recovery_points: vec![a.clone()],
            }],
        );
        let mut dest = snapshot(
            DST,
            vec![VaultContents {
                vault: dv,
                recovery_points: vec![d1, d2],
            }],
        );
        let plan = Planner::new(DST, mapping("daily", "dr"))
            .plan(&source, &dest)
            .unwrap();
        assert_eq!(plan.tasks[0].status, TaskStatus::Skipped);
        assert!(plan.tasks[0].reason.as_deref().unwrap().starts_with("ambiguous"));

        // A marker on one of them settles it.
        dest.vaults[0].recovery_points[1].copy_source_arn = Some(a.arn.clone());
        let plan = Planner::new(DST, mapping("daily", "dr"))
            .plan(&source, &dest)
            .unwrap();
        assert!(plan.tasks.is_empty());
        assert_eq!(plan.already_present, 1);
    }

    #[test]
    fn expiring_copies_and_incomplete_sources() {
        let sv = vault(SRC, "us-east-1", "daily");
        let dv = vault(DST, "us-east-1", "dr");
        let a = point(&sv, "a", 1);
        let mut partial = point(&sv, "p", 2);
        partial.status = RecoveryPointStatus::Partial;
        let mut expired = point(&dv, "old", 1);
        expired.copy_source_arn = Some(a.arn.clone());
        expired.status = RecoveryPointStatus::Expired;
        let source = snapshot(
            SRC,
            vec![VaultContents {
                vault: sv.clone(),
                recovery_points: vec![a, partial],
            }],
        );
        let dest = snapshot(
            DST,
            vec![VaultContents {
                vault: dv,
                recovery_points: vec![expired],
            }],
        );
        let plan = Planner::new(DST, mapping("daily", "dr"))
            .plan(&source, &dest)
            .unwrap();
        assert_eq!(plan.count(TaskStatus::Pending), 1);
        assert_eq!(plan.excluded.len(), 1);
        assert_eq!(plan.excluded[0].reason, "status PARTIAL");
    }

    #[test]
    fn missing_destination_vault_is_a_config_error() {
        let sv = vault(SRC, "us-east-1", "daily");
        let source = snapshot(
            SRC,
            vec![VaultContents {
                vault: sv.clone(),
                recovery_points: vec![point(&sv, "a", 1)],
            }],
        );
        let dest = snapshot(DST, vec![]);
        let err = Planner::new(DST, mapping("daily", "nope"))
            .plan(&source, &dest)
            .unwrap_err();
        assert!(err.is_config(), "{err}");
    }

    #[test]
    fn region_override_targets_other_region() {
        let sv = vault(SRC, "us-east-1", "daily");
        let dv = vault(DST, "us-west-2", "dr");
        let source = snapshot(
            SRC,
            vec![VaultContents {
                vault: sv.clone(),
                recovery_points: vec![point(&sv, "a", 1)],
            }],
        );
        let dest = snapshot(
            DST,
            vec![VaultContents {
                vault: dv.clone(),
                recovery_points: vec![],
            }],
        );
        let mut m = BTreeMap::new();
        m.insert(
            "daily".to_string(),
            VaultTarget::Detailed {
                vault: "dr".into(),
                region: Some("us-west-2".into()),
            },
        );
        let plan = Planner::new(DST, m).plan(&source, &dest).unwrap();
        assert_eq!(plan.tasks[0].destination_region, "us-west-2");
        assert_eq!(plan.tasks[0].destination_vault_arn, dv.arn);
    }

    #[test]
    fn fingerprint_tracks_task_set() {
        let sv = vault(SRC, "us-east-1", "daily");
        let dv = vault(DST, "us-east-1", "dr");
        let source = snapshot(
            SRC,
            vec![VaultContents {
                vault: sv.clone(),
                recovery_points: vec![point(&sv, "a", 1)],
            }],
        );
        let dest = snapshot(
            DST,
            vec![VaultContents {
                vault: dv,
                recovery_points: vec![],
            }],
        );
        let planner = Planner::new(DST, mapping("daily", "dr"));
        let p1 = planner.plan(&source, &dest).unwrap();
        let p2 = planner.plan(&source, &dest).unwrap();
        assert_eq!(p1.fingerprint(), p2.fingerprint());
        assert_eq!(p1.fingerprint().len(), 64);
    }
}
