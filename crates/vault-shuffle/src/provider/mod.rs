use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{RecoveryPoint, TaskKey, Vault};

pub mod aws_cli;
pub mod fake;

pub use aws_cli::AwsCliProvider;
pub use fake::FakeProvider;

#[derive(Debug, Clone, Default)]
pub struct RecoveryPointPage {
    pub items: Vec<RecoveryPoint>,
    /// `None` once the listing is exhausted.
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub source_arn: String,
    pub source_account: String,
    pub source_region: String,
    pub source_vault: String,
    pub destination_account: String,
    pub destination_region: String,
    pub destination_vault: String,
    pub destination_vault_arn: String,
    pub idempotency_token: String,
}

/// Provider-side reference to a started copy job. Persisted in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub account: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyJobState {
    Running,
    Succeeded {
        destination_recovery_point_arn: Option<String>,
    },
    Failed {
        message: String,
    },
}

/// Capabilities the migration core needs from a backup service.
pub trait BackupProvider: Send + Sync {
    fn list_vaults(&self, account: &str, region: &str) -> Result<Vec<Vault>>;

    fn list_recovery_points(
        &self,
        vault_name: &str,
        account: &str,
        region: &str,
        next_token: Option<&str>,
    ) -> Result<RecoveryPointPage>;

    fn describe_recovery_point(&self, arn: &str, vault_name: &str) -> Result<RecoveryPoint>;

    fn start_copy_job(&self, req: &CopyRequest) -> Result<JobHandle>;

    fn poll_copy_job(&self, job: &JobHandle) -> Result<CopyJobState>;
}

/// Stable per-attempt token so a replayed start request maps to the same job.
pub fn idempotency_token(key: &TaskKey, attempt: u32) -> String {
    let mut h = Sha256::new();
    h.update(key.source_arn.as_bytes());
    h.update(b"\n");
    h.update(key.destination_vault.as_bytes());
    h.update(b"\n");
    h.update(attempt.to_le_bytes());
    hex::encode(&h.finalize()[..16])
}

/// Parts of an `arn:partition:service:region:account:resource` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArnParts<'a> {
    pub service: &'a str,
    pub region: &'a str,
    pub account: &'a str,
    pub resource: &'a str,
}

pub fn parse_arn(arn: &str) -> Result<ArnParts<'_>> {
    let mut it = arn.splitn(6, ':');
    let (Some("arn"), Some(_partition), Some(service), Some(region), Some(account), Some(resource)) =
        (it.next(), it.next(), it.next(), it.next(), it.next(), it.next())
    else {
        return Err(Error::permanent(format!("malformed ARN '{arn}'")));
    };
    Ok(ArnParts {
        service,
        region,
        account,
        resource,
    })
}
