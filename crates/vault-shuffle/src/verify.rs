use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::CheckpointState;
use crate::error::Result;
use crate::inventory::InventoryEngine;
use crate::model::{CopyTask, RecoveryPoint, RecoveryPointStatus, TaskKey, TaskStatus, Vault, VaultContents};
use crate::planner::is_equivalent;
use crate::sanitize::clean_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    Missing,
    NotCompleted,
    SizeMismatch,
    ChecksumMismatch,
    Ambiguous,
    Unverifiable,
}

impl MismatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::NotCompleted => "not_completed",
            Self::SizeMismatch => "size_mismatch",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::Ambiguous => "ambiguous",
            Self::Unverifiable => "unverifiable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub key: TaskKey,
    pub kind: MismatchKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub verified_at: DateTime<Utc>,
    pub checked: usize,
    pub verified: usize,
    pub mismatches: Vec<Mismatch>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Re-lists the destination vaults behind SUCCEEDED tasks and checks each
/// copy landed intact. Mismatches are reported, never repaired.
pub struct VerificationEngine {
    inventory: InventoryEngine,
}

impl VerificationEngine {
    pub fn new(inventory: InventoryEngine) -> Self {
        Self { inventory }
    }

    /// `tasks` carry their final statuses; `progress` supplies the landed
    /// destination arns where the provider reported them.
    pub fn verify(&self, tasks: &[CopyTask], progress: &CheckpointState) -> Result<VerificationReport> {
        let succeeded: Vec<&CopyTask> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .collect();

        let mut vaults: BTreeMap<String, Vault> = BTreeMap::new();
        for t in &succeeded {
            vaults
                .entry(t.destination_vault_arn.clone())
                .or_insert_with(|| Vault {
                    name: t.key.destination_vault.clone(),
                    arn: t.destination_vault_arn.clone(),
                    region: t.destination_region.clone(),
                    account_id: t.destination_account.clone(),
                });
        }
        let vaults: Vec<Vault> = vaults.into_values().collect();
        info!(tasks = succeeded.len(), vaults = vaults.len(), "verifying copies");

        let listed: BTreeMap<String, std::result::Result<VaultContents, String>> = self
            .inventory
            .scan_vaults(&vaults)
            .into_iter()
            .map(|(v, r)| (v.arn, r.map_err(|e| clean_message(e.message()))))
            .collect();

        let mut mismatches = Vec::new();
        for t in &succeeded {
            let landed = progress
                .tasks
                .get(&t.key.encode())
                .and_then(|r| r.destination_recovery_point_arn.as_deref());
            let outcome = match listed.get(&t.destination_vault_arn) {
                Some(Ok(contents)) => check_task(t, landed, contents),
                Some(Err(reason)) => Some((
                    MismatchKind::Unverifiable,
                    format!("destination vault could not be listed: {reason}"),
                )),
                None => Some((
                    MismatchKind::Unverifiable,
                    "destination vault was not listed".to_string(),
                )),
            };
            if let Some((kind, detail)) = outcome {
                warn!(task = %t.key, kind = kind.as_str(), %detail, "verification mismatch");
                mismatches.push(Mismatch {
                    key: t.key.clone(),
                    kind,
                    detail,
                });
            }
        }

        let checked = succeeded.len();
        let report = VerificationReport {
            verified_at: Utc::now(),
            checked,
            verified: checked - mismatches.len(),
            mismatches,
        };
        info!(checked = report.checked, verified = report.verified, mismatches = report.mismatches.len(), "verification finished");
        Ok(report)
    }
}

fn source_view(t: &CopyTask) -> RecoveryPoint {
    RecoveryPoint {
        arn: t.key.source_arn.clone(),
        vault_name: t.source_vault.clone(),
        region: t.source_region.clone(),
        account_id: t.source_account.clone(),
        resource_arn: t.resource_arn.clone(),
        resource_type: t.resource_type.clone(),
        creation_time: t.creation_time,
        completion_time: None,
        status: RecoveryPointStatus::Completed,
        backup_size_bytes: t.backup_size_bytes,
        checksum: t.checksum.clone(),
        copy_source_arn: None,
    }
}

fn check_task(
    t: &CopyTask,
    landed: Option<&str>,
    contents: &VaultContents,
) -> Option<(MismatchKind, String)> {
    let found = match landed {
        Some(arn) => match contents.recovery_points.iter().find(|rp| rp.arn == arn) {
            Some(rp) => rp,
            None => {
                return Some((
                    MismatchKind::Missing,
                    format!("{arn} not found in {}", contents.vault.name),
                ));
            }
        },
        None => {
            let source = source_view(t);
            let candidates: Vec<&RecoveryPoint> = contents
                .recovery_points
                .iter()
                .filter(|rp| is_equivalent(&source, rp))
                .collect();
            let marked: Vec<&RecoveryPoint> = candidates
                .iter()
                .copied()
                .filter(|rp| rp.copy_source_arn.as_deref() == Some(t.key.source_arn.as_str()))
                .collect();
            match (marked.first(), candidates.as_slice()) {
                (Some(rp), _) => *rp,
                (None, [only]) => *only,
                (None, []) => {
                    return Some((
                        MismatchKind::Missing,
                        format!("no copy of the source found in {}", contents.vault.name),
                    ));
                }
                (None, many) => {
                    return Some((
                        MismatchKind::Ambiguous,
                        format!("{} candidate copies in {}", many.len(), contents.vault.name),
                    ));
                }
            }
        }
    };

    if !found.is_completed() {
        return Some((
            MismatchKind::NotCompleted,
            format!("{} is {}", found.arn, found.status),
        ));
    }
    if let (Some(want), Some(got)) = (t.backup_size_bytes, found.backup_size_bytes)
        && want != got
    {
        return Some((
            MismatchKind::SizeMismatch,
            format!("expected {want} bytes, found {got}"),
        ));
    }
    if let (Some(want), Some(got)) = (&t.checksum, &found.checksum)
        && want != got
    {
        return Some((
            MismatchKind::ChecksumMismatch,
            format!("expected checksum {want}, found {got}"),
        ));
    }
    None
}
