//! Inventory -> Plan -> Copy -> Verify wiring, with the artifacts each stage
//! leaves in the state directory.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{info, warn};

use crate::checkpoint::{CheckpointState, CheckpointStore, load_state};
use crate::config::{MigrationConfig, RegionConfig};
use crate::error::{Error, Result};
use crate::events::{EventSink, NullSink};
use crate::executor::{CopyOrchestrator, ExecOptions, ExecutionResult};
use crate::inventory::{InventoryEngine, InventorySnapshot};
use crate::model::{CopyTask, TaskStatus};
use crate::planner::{MigrationPlan, Planner};
use crate::provider::BackupProvider;
use crate::retry::RetryPolicy;
use crate::verify::{VerificationEngine, VerificationReport};
use crate::workspace::{Workspace, write_json};

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub source: InventorySnapshot,
    pub destination: InventorySnapshot,
    pub plan: MigrationPlan,
}

impl PlanOutcome {
    pub fn scans_complete(&self) -> bool {
        self.source.is_complete() && self.destination.is_complete()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Discard checkpointed progress before planning.
    pub fresh: bool,
    /// Verify SUCCEEDED tasks once the run finishes.
    pub verify: bool,
}

#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub planned: PlanOutcome,
    pub execution: ExecutionResult,
    pub verification: Option<VerificationReport>,
}

impl CopyOutcome {
    pub fn is_success(&self) -> bool {
        self.planned.scans_complete()
            && self.execution.is_success()
            && self
                .verification
                .as_ref()
                .is_none_or(VerificationReport::is_clean)
    }
}

pub struct Pipeline {
    cfg: MigrationConfig,
    provider: Arc<dyn BackupProvider>,
    workspace: Workspace,
    sink: Arc<dyn EventSink>,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(cfg: MigrationConfig, provider: Arc<dyn BackupProvider>, workspace: Workspace) -> Self {
        Self {
            cfg,
            provider,
            workspace,
            sink: Arc::new(NullSink),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.cfg
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn inventory_engine(&self) -> InventoryEngine {
        InventoryEngine::new(Arc::clone(&self.provider), RetryPolicy::from_config(&self.cfg))
            .with_scan_concurrency(self.cfg.scan_concurrency)
            .with_sink(Arc::clone(&self.sink))
    }

    pub fn list(&self, scope: &RegionConfig) -> InventorySnapshot {
        self.inventory_engine().inventory(scope)
    }

    /// Scan both sides and diff them. Writes the snapshots and plan unless
    /// this is a dry run.
    pub fn plan(&self) -> Result<PlanOutcome> {
        self.cfg.validate()?;
        let prior = load_state(&self.workspace.checkpoint_path())?;
        let planned = self.plan_with(&prior)?;
        self.save_plan_artifacts(&planned)?;
        Ok(planned)
    }

    fn plan_with(&self, progress: &CheckpointState) -> Result<PlanOutcome> {
        let engine = self.inventory_engine();
        let source = engine.inventory(&self.cfg.source_scope()?);
        if !source.is_complete() {
            warn!(failed = source.failures.len(), "source scan incomplete; planning from the pairs that were scanned");
        }
        let mut destination = engine.inventory(&self.cfg.destination_scope()?);
        let marked = destination.apply_copy_markers(&progress.copy_markers());
        if marked > 0 {
            info!(marked, "applied copy markers from checkpoint");
        }
        let plan = Planner::from_config(&self.cfg).plan(&source, &destination)?;
        Ok(PlanOutcome {
            source,
            destination,
            plan,
        })
    }

    fn save_plan_artifacts(&self, planned: &PlanOutcome) -> Result<()> {
        if self.cfg.dry_run {
            return Ok(());
        }
        self.workspace.ensure()?;
        write_json(&self.workspace.source_inventory_path(), &planned.source)?;
        write_json(&self.workspace.destination_inventory_path(), &planned.destination)?;
        write_json(&self.workspace.plan_path(), &planned.plan)?;
        Ok(())
    }

    /// Plan and execute, resuming from the checkpoint. A dry run reads prior
    /// progress but never writes anything.
    pub fn copy(&self, opts: CopyOptions) -> Result<CopyOutcome> {
        self.cfg.validate()?;
        let dry_run = self.cfg.dry_run;
        let _lock = if dry_run {
            None
        } else {
            Some(self.workspace.lock()?)
        };

        let path = self.workspace.checkpoint_path();
        let mut store = if dry_run {
            CheckpointStore::load_ephemeral(&path)?
        } else {
            CheckpointStore::open(&path)?
        };
        if opts.fresh && !dry_run {
            info!("discarding checkpointed progress");
            store.reset()?;
        }

        let planned = self.plan_with(store.state())?;
        self.save_plan_artifacts(&planned)?;

        let execution = CopyOrchestrator::new(Arc::clone(&self.provider), ExecOptions::from_config(&self.cfg))
            .with_sink(Arc::clone(&self.sink))
            .with_cancel(Arc::clone(&self.cancel))
            .execute(&planned.plan, &mut store)?;

        let verification = if opts.verify && !dry_run && !execution.interrupted {
            let report = self.verify_tasks(&store.state().succeeded_tasks(), store.state())?;
            write_json(&self.workspace.verification_path(), &report)?;
            Some(report)
        } else {
            None
        };

        Ok(CopyOutcome {
            planned,
            execution,
            verification,
        })
    }

    /// Verify every copy the checkpoint records as SUCCEEDED, whichever run
    /// planned it.
    pub fn verify(&self) -> Result<VerificationReport> {
        let path = self.workspace.checkpoint_path();
        if !path.exists() {
            return Err(Error::msg(format!(
                "no checkpoint found in {}; run `copy` first",
                self.workspace.root().display()
            )));
        }
        let state = load_state(&path)?;
        let tasks = state.succeeded_tasks();
        let untracked = state.count(TaskStatus::Succeeded) - tasks.len();
        if untracked > 0 {
            warn!(untracked, "succeeded copies recorded without task metadata are not verified");
        }
        let report = self.verify_tasks(&tasks, &state)?;
        if !self.cfg.dry_run {
            write_json(&self.workspace.verification_path(), &report)?;
        }
        Ok(report)
    }

    fn verify_tasks(&self, tasks: &[CopyTask], state: &CheckpointState) -> Result<VerificationReport> {
        VerificationEngine::new(self.inventory_engine()).verify(tasks, state)
    }

    pub fn status(&self) -> Result<CheckpointState> {
        load_state(&self.workspace.checkpoint_path())
    }
}
