use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub name: String,
    pub arn: String,
    pub region: String,
    pub account_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPointStatus {
    Creating,
    Completed,
    Partial,
    Expired,
    Deleting,
}

impl RecoveryPointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Completed => "COMPLETED",
            Self::Partial => "PARTIAL",
            Self::Expired => "EXPIRED",
            Self::Deleting => "DELETING",
        }
    }

    /// Points on their way out never satisfy a copy.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Expired | Self::Deleting)
    }
}

impl fmt::Display for RecoveryPointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryPointStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATING" => Ok(Self::Creating),
            "COMPLETED" => Ok(Self::Completed),
            "PARTIAL" => Ok(Self::Partial),
            "EXPIRED" => Ok(Self::Expired),
            "DELETING" => Ok(Self::Deleting),
            other => Err(Error::msg(format!("unknown recovery point status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub arn: String,
    pub vault_name: String,
    pub region: String,
    pub account_id: String,
    pub resource_arn: String,
    pub resource_type: String,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    pub status: RecoveryPointStatus,
    #[serde(default)]
    pub backup_size_bytes: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
    // Set on points created by a copy job when the provider exposes the origin.
    #[serde(default)]
    pub copy_source_arn: Option<String>,
}

impl RecoveryPoint {
    pub fn is_completed(&self) -> bool {
        self.status == RecoveryPointStatus::Completed
    }

    pub fn age_days(&self, reference: DateTime<Utc>) -> i64 {
        (reference - self.creation_time).num_days()
    }
}

/// A vault together with the recovery points listed from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultContents {
    pub vault: Vault,
    pub recovery_points: Vec<RecoveryPoint>,
}

impl VaultContents {
    pub fn completed(&self) -> impl Iterator<Item = &RecoveryPoint> {
        self.recovery_points.iter().filter(|rp| rp.is_completed())
    }

    pub fn total_backup_size_bytes(&self) -> u64 {
        self.recovery_points
            .iter()
            .filter_map(|rp| rp.backup_size_bytes)
            .sum()
    }
}

/// Identity of a single copy: one source point into one destination vault.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub source_arn: String,
    pub destination_vault: String,
}

impl TaskKey {
    pub fn new(source_arn: impl Into<String>, destination_vault: impl Into<String>) -> Self {
        Self {
            source_arn: source_arn.into(),
            destination_vault: destination_vault.into(),
        }
    }

    /// Flat form used as the checkpoint map key.
    pub fn encode(&self) -> String {
        format!("{}|{}", self.source_arn, self.destination_vault)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_arn, self.destination_vault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyTask {
    pub key: TaskKey,
    pub source_account: String,
    pub source_region: String,
    pub source_vault: String,
    pub resource_arn: String,
    pub resource_type: String,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub backup_size_bytes: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
    pub destination_account: String,
    pub destination_region: String,
    pub destination_vault_arn: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CopyTask {
    pub fn source_arn(&self) -> &str {
        &self.key.source_arn
    }

    pub fn destination_vault(&self) -> &str {
        &self.key.destination_vault
    }
}
