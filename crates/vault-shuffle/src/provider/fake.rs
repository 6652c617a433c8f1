//! Deterministic in-memory provider. Backs the test-suite and local dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{RecoveryPoint, RecoveryPointStatus, Vault};
use crate::provider::{BackupProvider, CopyJobState, CopyRequest, JobHandle, RecoveryPointPage};

/// Scripted result for one start-copy call against a source arn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCopyOutcome {
    Succeed,
    JobFails(String),
    StartThrottled,
    StartDenied(String),
}

#[derive(Debug, Clone)]
struct PairFailure {
    transient: bool,
    message: String,
    // `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct FakeJob {
    request: CopyRequest,
    polls_left: u32,
    fails_with: Option<String>,
    result: Option<CopyJobState>,
}

struct FakeState {
    vaults: BTreeMap<(String, String), Vec<Vault>>,
    points: BTreeMap<String, Vec<RecoveryPoint>>,
    page_size: usize,
    repeat_page_boundary: bool,
    pair_failures: BTreeMap<(String, String), PairFailure>,
    scripts: BTreeMap<String, VecDeque<FakeCopyOutcome>>,
    jobs: BTreeMap<String, FakeJob>,
    polls_to_complete: u32,
    next_id: u64,
    start_calls: Vec<String>,
    list_page_calls: usize,
    in_flight: usize,
    max_in_flight: usize,
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
    poll_failures: u32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            vaults: BTreeMap::new(),
            points: BTreeMap::new(),
            page_size: 100,
            repeat_page_boundary: false,
            pair_failures: BTreeMap::new(),
            scripts: BTreeMap::new(),
            jobs: BTreeMap::new(),
            polls_to_complete: 1,
            next_id: 1,
            start_calls: Vec::new(),
            list_page_calls: 0,
            in_flight: 0,
            max_in_flight: 0,
            cancel_after: None,
            poll_failures: 0,
        }
    }
}

impl FakeState {
    fn check_pair(&mut self, account: &str, region: &str) -> Result<()> {
        let k = (account.to_string(), region.to_string());
        let Some(f) = self.pair_failures.get_mut(&k) else {
            return Ok(());
        };
        let err = if f.transient {
            Error::transient(f.message.clone())
        } else {
            Error::permanent(f.message.clone())
        };
        let exhausted = match f.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.pair_failures.remove(&k);
        }
        Err(err)
    }

    fn find_vault(&self, account: &str, region: &str, name: &str) -> Option<&Vault> {
        self.vaults
            .get(&(account.to_string(), region.to_string()))?
            .iter()
            .find(|v| v.name == name)
    }

    fn find_point_mut(&mut self, arn: &str) -> Option<&mut RecoveryPoint> {
        self.points
            .values_mut()
            .flat_map(|v| v.iter_mut())
            .find(|rp| rp.arn == arn)
    }

    fn land_copy(&mut self, req: &CopyRequest) -> Result<String> {
        let source = self
            .points
            .values()
            .flat_map(|v| v.iter())
            .find(|rp| rp.arn == req.source_arn)
            .cloned()
            .ok_or_else(|| Error::permanent(format!("source {} vanished", req.source_arn)))?;
        let id = self.next_id;
        self.next_id += 1;
        let arn = format!(
            "arn:aws:backup:{}:{}:recovery-point:copy-{id}",
            req.destination_region, req.destination_account
        );
        let copy = RecoveryPoint {
            arn: arn.clone(),
            vault_name: req.destination_vault.clone(),
            region: req.destination_region.clone(),
            account_id: req.destination_account.clone(),
            completion_time: Some(Utc::now()),
            status: RecoveryPointStatus::Completed,
            copy_source_arn: Some(req.source_arn.clone()),
            ..source
        };
        self.points
            .entry(req.destination_vault_arn.clone())
            .or_default()
            .push(copy);
        Ok(arn)
    }
}

#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_vault(&self, account: &str, region: &str, name: &str) -> Vault {
        let vault = Vault {
            name: name.to_string(),
            arn: format!("arn:aws:backup:{region}:{account}:backup-vault:{name}"),
            region: region.to_string(),
            account_id: account.to_string(),
        };
        let mut s = self.state();
        s.vaults
            .entry((account.to_string(), region.to_string()))
            .or_default()
            .push(vault.clone());
        s.points.entry(vault.arn.clone()).or_default();
        vault
    }

    /// Adds a COMPLETED EBS point with an id-derived arn.
    pub fn add_recovery_point(
        &self,
        vault: &Vault,
        id: &str,
        creation_time: DateTime<Utc>,
        size: Option<u64>,
    ) -> RecoveryPoint {
        let rp = RecoveryPoint {
            arn: format!(
                "arn:aws:backup:{}:{}:recovery-point:{id}",
                vault.region, vault.account_id
            ),
            vault_name: vault.name.clone(),
            region: vault.region.clone(),
            account_id: vault.account_id.clone(),
            resource_arn: format!(
                "arn:aws:ec2:{}:{}:volume/vol-{id}",
                vault.region, vault.account_id
            ),
            resource_type: "EBS".into(),
            creation_time,
            completion_time: Some(creation_time),
            status: RecoveryPointStatus::Completed,
            backup_size_bytes: size,
            checksum: None,
            copy_source_arn: None,
        };
        self.insert_recovery_point(vault, rp.clone());
        rp
    }

    pub fn insert_recovery_point(&self, vault: &Vault, rp: RecoveryPoint) {
        self.state()
            .points
            .entry(vault.arn.clone())
            .or_default()
            .push(rp);
    }

    pub fn recovery_points_in(&self, vault: &Vault) -> Vec<RecoveryPoint> {
        self.state()
            .points
            .get(&vault.arn)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_status(&self, arn: &str, status: RecoveryPointStatus) {
        if let Some(rp) = self.state().find_point_mut(arn) {
            rp.status = status;
        }
    }

    pub fn set_size(&self, arn: &str, size: Option<u64>) {
        if let Some(rp) = self.state().find_point_mut(arn) {
            rp.backup_size_bytes = size;
        }
    }

    pub fn set_page_size(&self, n: usize) {
        self.state().page_size = n.max(1);
    }

    /// Each page after the first repeats the previous page's last item,
    /// as a retried list request can.
    pub fn repeat_page_boundary(&self, on: bool) {
        self.state().repeat_page_boundary = on;
    }

    pub fn fail_pair(&self, account: &str, region: &str, message: &str) {
        self.state().pair_failures.insert(
            (account.to_string(), region.to_string()),
            PairFailure {
                transient: false,
                message: message.to_string(),
                remaining: None,
            },
        );
    }

    /// Throttle the next `times` list calls for the pair.
    pub fn throttle_pair(&self, account: &str, region: &str, times: u32) {
        self.state().pair_failures.insert(
            (account.to_string(), region.to_string()),
            PairFailure {
                transient: true,
                message: "ThrottlingException: Rate exceeded".into(),
                remaining: Some(times.max(1)),
            },
        );
    }

    pub fn script_copy(&self, source_arn: &str, outcomes: Vec<FakeCopyOutcome>) {
        self.state()
            .scripts
            .insert(source_arn.to_string(), outcomes.into());
    }

    /// Number of RUNNING polls before a job settles.
    pub fn set_polls_to_complete(&self, n: u32) {
        self.state().polls_to_complete = n;
    }

    /// Raise `flag` once `n` start-copy calls have been made.
    pub fn cancel_after_starts(&self, n: usize, flag: Arc<AtomicBool>) {
        self.state().cancel_after = Some((n, flag));
    }

    /// Drop every known job, as if handles expired provider-side.
    pub fn forget_jobs(&self) {
        let mut s = self.state();
        s.jobs.clear();
        s.in_flight = 0;
    }

    /// Throttle the next `times` copy-job polls, whichever job they are for.
    pub fn fail_polls(&self, times: u32) {
        self.state().poll_failures = times;
    }

    /// Let every outstanding job settle on its next poll.
    pub fn settle_jobs(&self) {
        for j in self.state().jobs.values_mut() {
            j.polls_left = 0;
        }
    }

    pub fn start_calls(&self) -> usize {
        self.state().start_calls.len()
    }

    pub fn started_sources(&self) -> Vec<String> {
        self.state().start_calls.clone()
    }

    pub fn list_page_calls(&self) -> usize {
        self.state().list_page_calls
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }
}

impl BackupProvider for FakeProvider {
    fn list_vaults(&self, account: &str, region: &str) -> Result<Vec<Vault>> {
        let mut s = self.state();
        s.check_pair(account, region)?;
        Ok(s.vaults
            .get(&(account.to_string(), region.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn list_recovery_points(
        &self,
        vault_name: &str,
        account: &str,
        region: &str,
        next_token: Option<&str>,
    ) -> Result<RecoveryPointPage> {
        let mut s = self.state();
        s.list_page_calls += 1;
        s.check_pair(account, region)?;
        let vault = s
            .find_vault(account, region, vault_name)
            .cloned()
            .ok_or_else(|| {
                Error::permanent(format!(
                    "ResourceNotFoundException: vault {vault_name} not found in {account}/{region}"
                ))
            })?;
        let all = s.points.get(&vault.arn).cloned().unwrap_or_default();
        let offset = match next_token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| Error::permanent(format!("invalid next token '{t}'")))?,
            None => 0,
        };
        let end = (offset + s.page_size).min(all.len());
        let mut items = Vec::new();
        if s.repeat_page_boundary && offset > 0 && offset <= all.len() {
            items.push(all[offset - 1].clone());
        }
        if offset < all.len() {
            items.extend_from_slice(&all[offset..end]);
        }
        Ok(RecoveryPointPage {
            items,
            next_token: (end < all.len()).then(|| end.to_string()),
        })
    }

    fn describe_recovery_point(&self, arn: &str, _vault_name: &str) -> Result<RecoveryPoint> {
        self.state()
            .points
            .values()
            .flat_map(|v| v.iter())
            .find(|rp| rp.arn == arn)
            .cloned()
            .ok_or_else(|| {
                Error::permanent(format!(
                    "ResourceNotFoundException: recovery point {arn} not found"
                ))
            })
    }

    fn start_copy_job(&self, req: &CopyRequest) -> Result<JobHandle> {
        let mut s = self.state();
        s.start_calls.push(req.source_arn.clone());
        if let Some((n, flag)) = s.cancel_after.as_ref()
            && s.start_calls.len() >= *n
        {
            flag.store(true, Ordering::Relaxed);
        }

        let outcome = s
            .scripts
            .get_mut(&req.source_arn)
            .and_then(|q| q.pop_front())
            .unwrap_or(FakeCopyOutcome::Succeed);
        let fails_with = match outcome {
            FakeCopyOutcome::StartThrottled => {
                return Err(Error::transient("ThrottlingException: Rate exceeded"));
            }
            FakeCopyOutcome::StartDenied(msg) => return Err(Error::permanent(msg)),
            FakeCopyOutcome::JobFails(msg) => Some(msg),
            FakeCopyOutcome::Succeed => None,
        };

        if s
            .find_vault(
                &req.destination_account,
                &req.destination_region,
                &req.destination_vault,
            )
            .is_none()
        {
            return Err(Error::permanent(format!(
                "ResourceNotFoundException: destination vault {} not found",
                req.destination_vault_arn
            )));
        }

        let job_id = format!("job-{}", s.next_id);
        s.next_id += 1;
        let polls_left = s.polls_to_complete;
        s.jobs.insert(
            job_id.clone(),
            FakeJob {
                request: req.clone(),
                polls_left,
                fails_with,
                result: None,
            },
        );
        s.in_flight += 1;
        s.max_in_flight = s.max_in_flight.max(s.in_flight);
        Ok(JobHandle {
            job_id,
            account: req.source_account.clone(),
            region: req.source_region.clone(),
        })
    }

    fn poll_copy_job(&self, job: &JobHandle) -> Result<CopyJobState> {
        let mut s = self.state();
        if s.poll_failures > 0 {
            s.poll_failures -= 1;
            return Err(Error::transient("ThrottlingException: Rate exceeded"));
        }
        let Some(mut j) = s.jobs.get(&job.job_id).cloned() else {
            return Err(Error::permanent(format!(
                "ResourceNotFoundException: copy job {} not found",
                job.job_id
            )));
        };
        if let Some(done) = j.result.clone() {
            return Ok(done);
        }
        if j.polls_left > 0 {
            j.polls_left -= 1;
            s.jobs.insert(job.job_id.clone(), j);
            return Ok(CopyJobState::Running);
        }

        let state = match j.fails_with.clone() {
            Some(message) => CopyJobState::Failed { message },
            None => {
                let arn = s.land_copy(&j.request)?;
                CopyJobState::Succeeded {
                    destination_recovery_point_arn: Some(arn),
                }
            }
        };
        s.in_flight = s.in_flight.saturating_sub(1);
        j.result = Some(state.clone());
        s.jobs.insert(job.job_id.clone(), j);
        Ok(state)
    }
}
