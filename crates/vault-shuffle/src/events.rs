use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Instant;

use crate::model::{TaskKey, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PairScanned {
        account: String,
        region: String,
        vaults: usize,
        recovery_points: usize,
    },
    PairFailed {
        account: String,
        region: String,
        reason: String,
    },
    TaskStarted {
        key: TaskKey,
        job_id: String,
        attempt: u32,
    },
    TaskResumed {
        key: TaskKey,
        job_id: String,
    },
    TaskRetrying {
        key: TaskKey,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    TaskFinished {
        key: TaskKey,
        status: TaskStatus,
        error: Option<String>,
    },
    RunDone {
        succeeded: usize,
        failed: usize,
        skipped: usize,
        unfinished: usize,
        interrupted: bool,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, ev: Event);
}

#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _ev: Event) {}
}

/// Human-oriented progress lines on stderr; stdout is left for reports.
#[derive(Default)]
pub struct ConsoleSink {
    started_at: Mutex<Option<Instant>>,
}

impl ConsoleSink {
    fn elapsed_secs(&self) -> u64 {
        let Ok(mut g) = self.started_at.lock() else {
            return 0;
        };
        g.get_or_insert_with(Instant::now).elapsed().as_secs()
    }
}

impl EventSink for ConsoleSink {
    fn emit(&self, ev: Event) {
        let t = self.elapsed_secs();
        match ev {
            Event::PairScanned {
                account,
                region,
                vaults,
                recovery_points,
            } => eprintln!(
                "[{t:>5}s] SCAN: {account}/{region} vaults={vaults} recovery_points={recovery_points}"
            ),
            Event::PairFailed {
                account,
                region,
                reason,
            } => eprintln!("[{t:>5}s] SCAN FAILED: {account}/{region} {reason}"),
            Event::TaskStarted {
                key,
                job_id,
                attempt,
            } => eprintln!("[{t:>5}s] COPY: {key} job={job_id} attempt={attempt}"),
            Event::TaskResumed { key, job_id } => {
                eprintln!("[{t:>5}s] RESUME: {key} job={job_id}")
            }
            Event::TaskRetrying {
                key,
                attempt,
                delay_ms,
                error,
            } => eprintln!(
                "[{t:>5}s] RETRY: {key} attempt={attempt} in {delay_ms}ms ({error})"
            ),
            Event::TaskFinished { key, status, error } => match error {
                Some(e) => eprintln!("[{t:>5}s] {status}: {key} {e}"),
                None => eprintln!("[{t:>5}s] {status}: {key}"),
            },
            Event::RunDone {
                succeeded,
                failed,
                skipped,
                unfinished,
                interrupted,
            } => {
                let state = if interrupted { "interrupted" } else { "done" };
                eprintln!(
                    "[{t:>5}s] RUN {state}: succeeded={succeeded} failed={failed} skipped={skipped} unfinished={unfinished}"
                );
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }
}
