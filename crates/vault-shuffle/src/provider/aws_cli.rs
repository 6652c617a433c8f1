//! `BackupProvider` backed by the `aws` CLI (v2) with JSON output.

use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::AwsConfig;
use crate::error::{Error, Result};
use crate::model::{RecoveryPoint, RecoveryPointStatus, Vault};
use crate::provider::{
    BackupProvider, CopyJobState, CopyRequest, JobHandle, RecoveryPointPage, parse_arn,
};
use crate::sanitize::clean_message;

const DEFAULT_PAGE_SIZE: usize = 100;

const TRANSIENT_MARKERS: &[&str] = &[
    "throttl",
    "toomanyrequests",
    "requestlimitexceeded",
    "rate exceeded",
    "limitexceededexception",
    "serviceunavailable",
    "internalfailure",
    "internalservererror",
    "could not connect",
    "connection reset",
    "connection was closed",
    "read timeout",
    "connect timeout",
    "endpointconnectionerror",
];

#[derive(Debug, Clone)]
struct SessionCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl SessionCredentials {
    fn fresh(&self) -> bool {
        match self.expires_at {
            Some(t) => t - chrono::Duration::minutes(5) > Utc::now(),
            None => true,
        }
    }
}

// Per-account setting first, then the global one. Blank counts as unset.
fn pick<'a>(per: Option<&'a Option<String>>, global: &'a Option<String>) -> Option<&'a str> {
    per.and_then(|v| v.as_deref())
        .or(global.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

struct Access<'a> {
    profile: Option<&'a str>,
    role_arn: Option<&'a str>,
    external_id: Option<&'a str>,
}

pub struct AwsCliProvider {
    cfg: AwsConfig,
    program: String,
    page_size: usize,
    sessions: Mutex<BTreeMap<String, SessionCredentials>>,
}

impl AwsCliProvider {
    pub fn new(cfg: AwsConfig) -> Self {
        Self {
            cfg,
            program: "aws".into(),
            page_size: DEFAULT_PAGE_SIZE,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n.max(1);
        self
    }

    fn access_for(&self, account: &str) -> Access<'_> {
        let per = self.cfg.accounts.get(account);
        Access {
            profile: pick(per.map(|p| &p.profile), &self.cfg.profile),
            role_arn: pick(per.map(|p| &p.assume_role_arn), &self.cfg.assume_role_arn),
            external_id: pick(per.map(|p| &p.external_id), &self.cfg.external_id),
        }
    }

    fn credentials_for(&self, account: &str, access: &Access<'_>) -> Result<SessionCredentials> {
        let Some(role_arn) = access.role_arn else {
            return Err(Error::config(format!("no role configured for account {account}")));
        };
        {
            let cache = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(c) = cache.get(account)
                && c.fresh()
            {
                return Ok(c.clone());
            }
        }

        let mut cmd = Command::new(&self.program);
        if let Some(p) = access.profile {
            cmd.arg("--profile").arg(p);
        }
        cmd.arg("sts")
            .arg("assume-role")
            .arg("--role-arn")
            .arg(role_arn)
            .arg("--role-session-name")
            .arg(&self.cfg.session_name)
            .arg("--output")
            .arg("json");
        if let Some(ext) = access.external_id {
            cmd.arg("--external-id").arg(ext);
        }
        debug!(%account, %role_arn, "assuming role");
        let v = self.run_json(cmd, "sts assume-role")?;
        let creds = parse_credentials(&v)?;
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.to_string(), creds.clone());
        Ok(creds)
    }

    fn backup_command(&self, account: &str, region: &str) -> Result<Command> {
        let access = self.access_for(account);
        let mut cmd = Command::new(&self.program);
        if access.role_arn.is_some() {
            let c = self.credentials_for(account, &access)?;
            cmd.env("AWS_ACCESS_KEY_ID", c.access_key_id)
                .env("AWS_SECRET_ACCESS_KEY", c.secret_access_key)
                .env("AWS_SESSION_TOKEN", c.session_token);
        } else if let Some(p) = access.profile {
            cmd.arg("--profile").arg(p);
        }
        cmd.arg("--region")
            .arg(region)
            .arg("--output")
            .arg("json")
            .arg("backup");
        Ok(cmd)
    }

    fn run_json(&self, mut cmd: Command, what: &str) -> Result<Value> {
        let out = run_with_timeout(&mut cmd, self.cfg.call_timeout())?;
        if !out.status.success() {
            return Err(classify_failure(what, &command_summary(&out)));
        }
        let body = String::from_utf8_lossy(&out.stdout);
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::transient(format!("{what}: unparseable JSON output: {e}")))
    }
}

impl BackupProvider for AwsCliProvider {
    fn list_vaults(&self, account: &str, region: &str) -> Result<Vec<Vault>> {
        let mut cmd = self.backup_command(account, region)?;
        cmd.arg("list-backup-vaults");
        let v = self.run_json(cmd, "list-backup-vaults")?;
        parse_vaults(&v, account, region)
    }

    fn list_recovery_points(
        &self,
        vault_name: &str,
        account: &str,
        region: &str,
        next_token: Option<&str>,
    ) -> Result<RecoveryPointPage> {
        let mut cmd = self.backup_command(account, region)?;
        cmd.arg("list-recovery-points-by-backup-vault")
            .arg("--backup-vault-name")
            .arg(vault_name)
            .arg("--max-items")
            .arg(self.page_size.to_string());
        if let Some(t) = next_token {
            cmd.arg("--starting-token").arg(t);
        }
        let v = self.run_json(cmd, "list-recovery-points-by-backup-vault")?;
        parse_recovery_point_page(&v, vault_name, account, region)
    }

    fn describe_recovery_point(&self, arn: &str, vault_name: &str) -> Result<RecoveryPoint> {
        let parts = parse_arn(arn)?;
        let mut cmd = self.backup_command(parts.account, parts.region)?;
        cmd.arg("describe-recovery-point")
            .arg("--backup-vault-name")
            .arg(vault_name)
            .arg("--recovery-point-arn")
            .arg(arn);
        let v = self.run_json(cmd, "describe-recovery-point")?;
        parse_recovery_point(&v, vault_name, parts.account, parts.region)
    }

    fn start_copy_job(&self, req: &CopyRequest) -> Result<JobHandle> {
        let Some(role) = self
            .cfg
            .copy_role_arn
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return Err(Error::config("aws.copy_role_arn is required to start copy jobs"));
        };
        let mut cmd = self.backup_command(&req.source_account, &req.source_region)?;
        cmd.arg("start-copy-job")
            .arg("--recovery-point-arn")
            .arg(&req.source_arn)
            .arg("--source-backup-vault-name")
            .arg(&req.source_vault)
            .arg("--destination-backup-vault-arn")
            .arg(&req.destination_vault_arn)
            .arg("--iam-role-arn")
            .arg(role)
            .arg("--idempotency-token")
            .arg(&req.idempotency_token);
        let v = self.run_json(cmd, "start-copy-job")?;
        let job_id = v
            .get("CopyJobId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::transient("start-copy-job: response has no CopyJobId"))?;
        Ok(JobHandle {
            job_id: job_id.to_string(),
            account: req.source_account.clone(),
            region: req.source_region.clone(),
        })
    }

    fn poll_copy_job(&self, job: &JobHandle) -> Result<CopyJobState> {
        let mut cmd = self.backup_command(&job.account, &job.region)?;
        cmd.arg("describe-copy-job")
            .arg("--copy-job-id")
            .arg(&job.job_id);
        let v = self.run_json(cmd, "describe-copy-job")?;
        parse_copy_job(&v)
    }
}

fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::permanent(format!("failed to run {:?}: {e}", cmd.get_program())))?;

    // Both pipes drain on their own threads while the child runs.
    let drain = |pipe: Option<Box<dyn Read + Send>>| {
        pipe.map(|mut p| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = p.read_to_end(&mut buf);
                buf
            })
        })
    };
    let out_h = drain(child.stdout.take().map(|p| Box::new(p) as Box<dyn Read + Send>));
    let err_h = drain(child.stderr.take().map(|p| Box::new(p) as Box<dyn Read + Send>));

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::transient(format!(
                    "aws call timed out after {}s",
                    timeout.as_secs()
                )));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(25)),
            Err(e) => return Err(Error::transient(format!("wait failed: {e}"))),
        }
    };

    let join = |h: Option<std::thread::JoinHandle<Vec<u8>>>| {
        h.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    Ok(Output {
        status,
        stdout: join(out_h),
        stderr: join(err_h),
    })
}

fn command_summary(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}

fn classify_failure(what: &str, summary: &str) -> Error {
    let msg = format!("{what}: {}", clean_message(summary));
    let lower = summary.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        Error::transient(msg)
    } else {
        Error::permanent(msg)
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn required<'a>(v: &'a Value, key: &str, what: &str) -> Result<&'a str> {
    str_field(v, key).ok_or_else(|| Error::msg(format!("{what}: missing field '{key}'")))
}

fn parse_time(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
        }
        _ => None,
    }
}

fn parse_status(raw: &str) -> Result<RecoveryPointStatus> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "AVAILABLE" => Ok(RecoveryPointStatus::Completed),
        "STOPPED" => Ok(RecoveryPointStatus::Partial),
        other => other.parse(),
    }
}

fn parse_credentials(v: &Value) -> Result<SessionCredentials> {
    let c = v
        .get("Credentials")
        .ok_or_else(|| Error::permanent("assume-role: response has no Credentials"))?;
    Ok(SessionCredentials {
        access_key_id: required(c, "AccessKeyId", "assume-role")?.to_string(),
        secret_access_key: required(c, "SecretAccessKey", "assume-role")?.to_string(),
        session_token: required(c, "SessionToken", "assume-role")?.to_string(),
        expires_at: c.get("Expiration").and_then(parse_time),
    })
}

fn parse_vaults(v: &Value, account: &str, region: &str) -> Result<Vec<Vault>> {
    let Some(arr) = v.get("BackupVaultList").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        out.push(Vault {
            name: required(item, "BackupVaultName", "list-backup-vaults")?.to_string(),
            arn: required(item, "BackupVaultArn", "list-backup-vaults")?.to_string(),
            region: region.to_string(),
            account_id: account.to_string(),
        });
    }
    Ok(out)
}

fn parse_recovery_point(
    item: &Value,
    vault_name: &str,
    account: &str,
    region: &str,
) -> Result<RecoveryPoint> {
    let what = "recovery point";
    let arn = required(item, "RecoveryPointArn", what)?;
    let creation_time = item
        .get("CreationDate")
        .and_then(parse_time)
        .ok_or_else(|| Error::msg(format!("{arn}: missing or invalid CreationDate")))?;
    Ok(RecoveryPoint {
        arn: arn.to_string(),
        vault_name: str_field(item, "BackupVaultName")
            .unwrap_or(vault_name)
            .to_string(),
        region: region.to_string(),
        account_id: account.to_string(),
        resource_arn: str_field(item, "ResourceArn").unwrap_or_default().to_string(),
        resource_type: str_field(item, "ResourceType")
            .unwrap_or("UNKNOWN")
            .to_string(),
        creation_time,
        completion_time: item.get("CompletionDate").and_then(parse_time),
        status: parse_status(required(item, "Status", what)?)?,
        backup_size_bytes: item.get("BackupSizeInBytes").and_then(Value::as_u64),
        checksum: None,
        copy_source_arn: None,
    })
}

fn parse_recovery_point_page(
    v: &Value,
    vault_name: &str,
    account: &str,
    region: &str,
) -> Result<RecoveryPointPage> {
    let mut items = Vec::new();
    // One unreadable item fails the page; the pair then shows up as a scan
    // failure instead of silently coming up short.
    if let Some(arr) = v.get("RecoveryPoints").and_then(Value::as_array) {
        for (i, item) in arr.iter().enumerate() {
            let rp = parse_recovery_point(item, vault_name, account, region).map_err(|e| {
                Error::permanent(format!(
                    "unreadable recovery point #{i} in {account}/{region}/{vault_name}: {}",
                    e.message()
                ))
            })?;
            items.push(rp);
        }
    }
    Ok(RecoveryPointPage {
        items,
        next_token: str_field(v, "NextToken").map(str::to_string),
    })
}

fn parse_copy_job(v: &Value) -> Result<CopyJobState> {
    let job = v
        .get("CopyJob")
        .ok_or_else(|| Error::transient("describe-copy-job: response has no CopyJob"))?;
    let state = required(job, "State", "describe-copy-job")?.to_ascii_uppercase();
    Ok(match state.as_str() {
        "CREATED" | "RUNNING" => CopyJobState::Running,
        "COMPLETED" => CopyJobState::Succeeded {
            destination_recovery_point_arn: str_field(job, "DestinationRecoveryPointArn")
                .map(str::to_string),
        },
        _ => CopyJobState::Failed {
            message: str_field(job, "StatusMessage")
                .map(clean_message)
                .unwrap_or_else(|| format!("copy job ended in state {state}")),
        },
    })
}
