//! Copy orchestration: a bounded pool of worker threads, each owning one copy
//! job, reporting to a single coordinating loop that alone mutates task state
//! and the checkpoint.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointStore, TaskRecord};
use crate::config::MigrationConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink, NullSink};
use crate::model::{CopyTask, TaskKey, TaskStatus};
use crate::planner::MigrationPlan;
use crate::provider::{BackupProvider, CopyJobState, CopyRequest, JobHandle, idempotency_token};
use crate::retry::{RetryPolicy, sleep_unless_cancelled};
use crate::sanitize::clean_message;

const IDLE_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub concurrency_limit: usize,
    pub dry_run: bool,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            dry_run: false,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl ExecOptions {
    pub fn from_config(cfg: &MigrationConfig) -> Self {
        Self {
            concurrency_limit: cfg.concurrency_limit.max(1),
            dry_run: cfg.dry_run,
            retry: RetryPolicy::from_config(cfg),
            poll_interval: cfg.poll_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    pub key: TaskKey,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Still PENDING or IN_PROGRESS (interrupted, or job state unresolved).
    pub unfinished: usize,
    pub failures: Vec<FailedTask>,
}

impl RunSummary {
    pub fn from_tasks(tasks: &[CopyTask]) -> Self {
        let mut s = Self::default();
        for t in tasks {
            match t.status {
                TaskStatus::Succeeded => s.succeeded += 1,
                TaskStatus::Skipped => s.skipped += 1,
                TaskStatus::Pending | TaskStatus::InProgress => s.unfinished += 1,
                TaskStatus::Failed => {
                    s.failed += 1;
                    s.failures.push(FailedTask {
                        key: t.key.clone(),
                        error: t.reason.clone().unwrap_or_else(|| "unknown error".into()),
                    });
                }
            }
        }
        s
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Plan order, with final statuses; `reason` carries the last error.
    pub tasks: Vec<CopyTask>,
    pub records: Vec<TaskRecord>,
    pub summary: RunSummary,
    pub interrupted: bool,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.summary.failed == 0 && self.summary.unfinished == 0
    }
}

enum Job {
    Start(CopyRequest),
    Resume(JobHandle),
}

enum Report {
    Started(JobHandle),
    Done(Outcome),
}

#[derive(Debug)]
enum Outcome {
    Succeeded {
        destination_recovery_point_arn: Option<String>,
    },
    Failed {
        error: String,
        retryable: bool,
    },
    /// The provider no longer knows the job; start over.
    JobLost {
        error: String,
    },
    /// Polling kept failing transiently; the job may still be running.
    Unresolved {
        error: String,
    },
    /// Stopped before a terminal state. The record is left as it is.
    Detached,
}

struct Worker {
    provider: Arc<dyn BackupProvider>,
    retry: RetryPolicy,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    tx: mpsc::Sender<(usize, Report)>,
    idx: usize,
}

impl Worker {
    fn run(self, job: Job) {
        let outcome = match job {
            Job::Start(req) => self.start(&req),
            Job::Resume(handle) => self.watch(&handle),
        };
        let _ = self.tx.send((self.idx, Report::Done(outcome)));
    }

    fn start(&self, req: &CopyRequest) -> Outcome {
        let what = format!("describe {}", req.source_arn);
        match self.retry.run(&what, || {
            self.provider
                .describe_recovery_point(&req.source_arn, &req.source_vault)
        }) {
            Ok(rp) if !rp.is_completed() => {
                return Outcome::Failed {
                    error: format!("source recovery point is {}", rp.status),
                    retryable: false,
                };
            }
            Ok(_) => {}
            Err(e) => {
                return Outcome::Failed {
                    error: clean_message(e.message()),
                    retryable: e.is_transient(),
                };
            }
        }
        if self.stop.load(Ordering::Relaxed) {
            return Outcome::Detached;
        }

        // Transient start errors reuse the same idempotency token.
        let handle = match self
            .retry
            .run("start copy job", || self.provider.start_copy_job(req))
        {
            Ok(h) => h,
            Err(e) => {
                return Outcome::Failed {
                    error: clean_message(e.message()),
                    retryable: e.is_transient(),
                };
            }
        };
        let _ = self.tx.send((self.idx, Report::Started(handle.clone())));
        self.watch(&handle)
    }

    fn watch(&self, handle: &JobHandle) -> Outcome {
        let mut transient = 0u32;
        loop {
            match self.provider.poll_copy_job(handle) {
                Ok(CopyJobState::Running) => {
                    transient = 0;
                    if !sleep_unless_cancelled(self.poll_interval, &self.stop) {
                        return Outcome::Detached;
                    }
                }
                Ok(CopyJobState::Succeeded {
                    destination_recovery_point_arn,
                }) => {
                    return Outcome::Succeeded {
                        destination_recovery_point_arn,
                    };
                }
                Ok(CopyJobState::Failed { message }) => {
                    return Outcome::Failed {
                        error: clean_message(&message),
                        retryable: true,
                    };
                }
                Err(e) if e.is_transient() => {
                    transient += 1;
                    if transient > self.retry.max_retries {
                        return Outcome::Unresolved {
                            error: clean_message(e.message()),
                        };
                    }
                    debug!(job = %handle.job_id, retry = transient, error = %e, "poll failed, backing off");
                    if !sleep_unless_cancelled(self.retry.delay_for(transient), &self.stop) {
                        return Outcome::Detached;
                    }
                }
                Err(e) => {
                    return Outcome::JobLost {
                        error: clean_message(e.message()),
                    };
                }
            }
        }
    }
}

fn copy_request(task: &CopyTask, attempt: u32) -> CopyRequest {
    CopyRequest {
        source_arn: task.key.source_arn.clone(),
        source_account: task.source_account.clone(),
        source_region: task.source_region.clone(),
        source_vault: task.source_vault.clone(),
        destination_account: task.destination_account.clone(),
        destination_region: task.destination_region.clone(),
        destination_vault: task.key.destination_vault.clone(),
        destination_vault_arn: task.destination_vault_arn.clone(),
        idempotency_token: idempotency_token(&task.key, attempt),
    }
}

pub struct CopyOrchestrator {
    provider: Arc<dyn BackupProvider>,
    opts: ExecOptions,
    sink: Arc<dyn EventSink>,
    cancel: Arc<AtomicBool>,
}

impl CopyOrchestrator {
    pub fn new(provider: Arc<dyn BackupProvider>, opts: ExecOptions) -> Self {
        Self {
            provider,
            opts,
            sink: Arc::new(NullSink),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Share an externally owned cancel flag (e.g. set from a signal handler).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run `plan` to completion (or until cancelled), resuming from `store`.
    ///
    /// Only errors that make further progress unsafe (a failed checkpoint
    /// write) are returned; task failures are reported in the result.
    pub fn execute(&self, plan: &MigrationPlan, store: &mut CheckpointStore) -> Result<ExecutionResult> {
        let dry_run = self.opts.dry_run;
        let mut tasks = plan.tasks.clone();
        let mut records: Vec<TaskRecord> = Vec::with_capacity(tasks.len());
        let mut ready: VecDeque<usize> = VecDeque::new();
        let mut resume: VecDeque<usize> = VecDeque::new();
        let mut changed: Vec<TaskRecord> = Vec::new();

        if !dry_run {
            let fp = plan.fingerprint();
            if let Some(prev) = store.state().plan_fingerprint.as_deref()
                && prev != fp
            {
                info!("plan differs from the checkpointed one; matching tasks keep their progress");
            }
            store.set_fingerprint(&fp)?;
        }

        for (i, task) in tasks.iter().enumerate() {
            let prior = store.get(&task.key).cloned();
            let rec = match prior {
                Some(mut p) if p.status == TaskStatus::Succeeded => {
                    debug!(task = %task.key, "already succeeded");
                    if p.task.is_none() && !dry_run {
                        p.task = Some(CopyTask {
                            status: TaskStatus::Succeeded,
                            reason: None,
                            ..task.clone()
                        });
                        changed.push(p.clone());
                    }
                    p
                }
                Some(mut p)
                    if !dry_run
                        && p.status == TaskStatus::InProgress
                        && p.job_handle.is_some() =>
                {
                    if p.task.is_none() {
                        p.task = Some(task.clone());
                        changed.push(p.clone());
                    }
                    resume.push_back(i);
                    p
                }
                prior => {
                    let mut r = TaskRecord::for_task(task, TaskStatus::Pending);
                    if let Some(p) = prior {
                        r.attempt_count = p.attempt_count;
                        r.last_error = p.last_error;
                    }
                    if task.status == TaskStatus::Skipped {
                        r.status = TaskStatus::Skipped;
                        r.last_error = task.reason.clone();
                    } else if dry_run {
                        r.status = TaskStatus::Skipped;
                        r.last_error = Some("dry-run".into());
                    } else {
                        ready.push_back(i);
                    }
                    changed.push(r.clone());
                    r
                }
            };
            records.push(rec);
        }

        if dry_run {
            info!(tasks = tasks.len(), "dry run: no copy jobs will be started");
        } else {
            self.adopt_unplanned(plan, store, &mut tasks, &mut records, &mut resume, &mut changed);
            store.record_many(changed)?;
            info!(
                pending = ready.len(),
                resuming = resume.len(),
                limit = self.opts.concurrency_limit,
                "copy run starting"
            );
            self.drive(&tasks, &mut records, store, ready, resume)?;
        }

        for (t, r) in tasks.iter_mut().zip(&records) {
            t.status = r.status;
            t.reason = match r.status {
                TaskStatus::Succeeded => None,
                _ => r.last_error.clone(),
            };
        }
        let summary = RunSummary::from_tasks(&tasks);
        let interrupted = self.cancel.load(Ordering::Relaxed);
        self.sink.emit(Event::RunDone {
            succeeded: summary.succeeded,
            failed: summary.failed,
            skipped: summary.skipped,
            unfinished: summary.unfinished,
            interrupted,
        });
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            unfinished = summary.unfinished,
            interrupted,
            "copy run finished"
        );
        Ok(ExecutionResult {
            tasks,
            records,
            summary,
            interrupted,
        })
    }

    /// Settle checkpoint records whose task dropped out of the plan while
    /// still unfinished. A source the destination now holds means a copy
    /// landed while nothing was watching it; an IN_PROGRESS record whose
    /// copy has not landed yet goes back to being polled.
    fn adopt_unplanned(
        &self,
        plan: &MigrationPlan,
        store: &CheckpointStore,
        tasks: &mut Vec<CopyTask>,
        records: &mut Vec<TaskRecord>,
        resume: &mut VecDeque<usize>,
        changed: &mut Vec<TaskRecord>,
    ) {
        let planned: HashSet<String> = tasks.iter().map(|t| t.key.encode()).collect();
        for (key, prior) in &store.state().tasks {
            if planned.contains(key)
                || !matches!(
                    prior.status,
                    TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Failed
                )
            {
                continue;
            }
            let mut rec = prior.clone();
            if let Some(dest_arn) = plan.present.get(key) {
                info!(task = %rec.key(), destination = %dest_arn, "copy found at the destination");
                rec.status = TaskStatus::Succeeded;
                rec.destination_recovery_point_arn = Some(dest_arn.clone());
                rec.job_handle = None;
                rec.last_error = None;
                if let Some(t) = rec.task.as_mut() {
                    t.status = TaskStatus::Succeeded;
                    t.reason = None;
                    tasks.push(t.clone());
                    records.push(rec.clone());
                }
                changed.push(rec);
            } else if rec.status == TaskStatus::InProgress
                && rec.job_handle.is_some()
                && let Some(t) = rec.task.clone()
            {
                debug!(task = %rec.key(), "resuming copy job outside the plan");
                resume.push_back(tasks.len());
                tasks.push(t);
                records.push(rec);
            } else {
                debug!(task = %rec.key(), status = %rec.status, "unfinished task is no longer planned");
            }
        }
    }

    fn drive(
        &self,
        tasks: &[CopyTask],
        records: &mut [TaskRecord],
        store: &mut CheckpointStore,
        mut ready: VecDeque<usize>,
        mut resume: VecDeque<usize>,
    ) -> Result<()> {
        let limit = self.opts.concurrency_limit.max(1);
        let max_retries = self.opts.retry.max_retries;
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(usize, Report)>();
        let mut running: HashMap<usize, JoinHandle<()>> = HashMap::new();
        let mut delayed: Vec<(Instant, usize)> = Vec::new();
        let mut attempts = vec![0u32; tasks.len()];
        let mut fatal: Option<Error> = None;
        // Slots of jobs whose state could not be read back. The provider may
        // still be running them, so they stay taken for the rest of the run.
        let mut held = 0usize;

        loop {
            if self.cancel.load(Ordering::Relaxed) || fatal.is_some() {
                stop.store(true, Ordering::Relaxed);
            }
            let stopping = stop.load(Ordering::Relaxed);

            let now = Instant::now();
            delayed.retain(|&(at, i)| {
                if at <= now {
                    ready.push_back(i);
                    false
                } else {
                    true
                }
            });

            // Fill worker slots. Resumed jobs go first: they already occupy
            // provider capacity.
            while !stopping && running.len() + held < limit {
                let (i, job) = if let Some(i) = resume.pop_front() {
                    let Some(handle) = records[i].job_handle.clone() else {
                        ready.push_back(i);
                        continue;
                    };
                    info!(task = %tasks[i].key, job = %handle.job_id, "resuming copy job");
                    self.sink.emit(Event::TaskResumed {
                        key: tasks[i].key.clone(),
                        job_id: handle.job_id.clone(),
                    });
                    (i, Job::Resume(handle))
                } else if let Some(i) = ready.pop_front() {
                    attempts[i] += 1;
                    records[i].attempt_count += 1;
                    (i, Job::Start(copy_request(&tasks[i], records[i].attempt_count)))
                } else {
                    break;
                };

                let worker = Worker {
                    provider: Arc::clone(&self.provider),
                    retry: self.opts.retry.clone(),
                    poll_interval: self.opts.poll_interval,
                    stop: Arc::clone(&stop),
                    tx: tx.clone(),
                    idx: i,
                };
                let tx_panic = tx.clone();
                let handle = std::thread::spawn(move || {
                    let r = std::panic::catch_unwind(AssertUnwindSafe(|| worker.run(job)));
                    if r.is_err() {
                        let _ = tx_panic.send((
                            i,
                            Report::Done(Outcome::Failed {
                                error: "copy worker panicked".into(),
                                retryable: false,
                            }),
                        ));
                    }
                });
                running.insert(i, handle);
            }

            if running.is_empty() {
                let idle = ready.is_empty() && resume.is_empty() && delayed.is_empty();
                if stopping || idle {
                    break;
                }
                if held >= limit {
                    warn!(held, waiting = ready.len() + resume.len() + delayed.len(), "every worker slot is held by an unresolved copy job");
                    break;
                }
                if ready.is_empty() && resume.is_empty() {
                    // Only backoff timers left.
                    let next = delayed.iter().map(|(at, _)| *at).min().unwrap_or(now);
                    sleep_unless_cancelled(next.saturating_duration_since(Instant::now()), &self.cancel);
                }
                continue;
            }

            let wait = delayed
                .iter()
                .map(|(at, _)| at.saturating_duration_since(Instant::now()))
                .min()
                .unwrap_or(IDLE_TICK)
                .min(IDLE_TICK);
            let (i, report) = match rx.recv_timeout(wait) {
                Ok(m) => m,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    fatal.get_or_insert(Error::msg("copy workers disconnected"));
                    break;
                }
            };
            let key = &tasks[i].key;

            match report {
                Report::Started(handle) => {
                    info!(task = %key, job = %handle.job_id, attempt = records[i].attempt_count, "copy job started");
                    self.sink.emit(Event::TaskStarted {
                        key: key.clone(),
                        job_id: handle.job_id.clone(),
                        attempt: records[i].attempt_count,
                    });
                    let rec = &mut records[i];
                    rec.status = TaskStatus::InProgress;
                    rec.job_handle = Some(handle);
                    rec.last_error = None;
                    if let Err(e) = store.record(rec.clone()) {
                        fatal.get_or_insert(e);
                    }
                }
                Report::Done(outcome) => {
                    if let Some(h) = running.remove(&i) {
                        let _ = h.join();
                    }
                    let rec = &mut records[i];
                    match outcome {
                        Outcome::Succeeded {
                            destination_recovery_point_arn,
                        } => {
                            info!(task = %key, "copy succeeded");
                            rec.status = TaskStatus::Succeeded;
                            rec.destination_recovery_point_arn = destination_recovery_point_arn;
                            rec.last_error = None;
                            self.sink.emit(Event::TaskFinished {
                                key: key.clone(),
                                status: TaskStatus::Succeeded,
                                error: None,
                            });
                        }
                        Outcome::Failed { error, retryable } => {
                            rec.job_handle = None;
                            rec.last_error = Some(error.clone());
                            if retryable && attempts[i] <= max_retries && !stopping {
                                let delay = self.opts.retry.delay_for(attempts[i]);
                                warn!(task = %key, attempt = attempts[i], delay_ms = delay.as_millis() as u64, %error, "copy attempt failed, retrying");
                                self.sink.emit(Event::TaskRetrying {
                                    key: key.clone(),
                                    attempt: attempts[i],
                                    delay_ms: delay.as_millis() as u64,
                                    error,
                                });
                                rec.status = TaskStatus::Pending;
                                delayed.push((Instant::now() + delay, i));
                            } else if retryable && stopping {
                                rec.status = TaskStatus::Pending;
                            } else {
                                warn!(task = %key, %error, "copy failed");
                                rec.status = TaskStatus::Failed;
                                self.sink.emit(Event::TaskFinished {
                                    key: key.clone(),
                                    status: TaskStatus::Failed,
                                    error: Some(error),
                                });
                            }
                        }
                        Outcome::JobLost { error } => {
                            rec.job_handle = None;
                            rec.last_error = Some(error.clone());
                            if attempts[i] <= max_retries {
                                warn!(task = %key, %error, "copy job handle not resolvable, restarting");
                                rec.status = TaskStatus::Pending;
                                ready.push_front(i);
                            } else {
                                rec.status = TaskStatus::Failed;
                                self.sink.emit(Event::TaskFinished {
                                    key: key.clone(),
                                    status: TaskStatus::Failed,
                                    error: Some(error),
                                });
                            }
                        }
                        Outcome::Unresolved { error } => {
                            warn!(task = %key, %error, "copy job state unresolved; slot stays held, left for the next run");
                            held += 1;
                            rec.last_error = Some(error);
                        }
                        Outcome::Detached => {
                            debug!(task = %key, "worker detached");
                            continue;
                        }
                    }
                    if let Err(e) = store.record(rec.clone()) {
                        fatal.get_or_insert(e);
                    }
                }
            }
        }

        for (_, h) in running.drain() {
            let _ = h.join();
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
