//! Plain-text and JSON renderings for the CLI. Everything returns a `String`
//! so the caller decides where it goes.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use clap::ValueEnum;

use crate::checkpoint::CheckpointState;
use crate::error::Result;
use crate::executor::RunSummary;
use crate::inventory::InventorySnapshot;
use crate::model::TaskStatus;
use crate::planner::MigrationPlan;
use crate::verify::VerificationReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Summary,
}

pub fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{v:.1} {}", UNITS[unit])
    }
}

fn ts(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

pub fn inventory(snap: &InventorySnapshot, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(snap)?),
        OutputFormat::Summary => Ok(inventory_summary(snap)),
        OutputFormat::Table => Ok(inventory_table(snap)),
    }
}

fn inventory_summary(snap: &InventorySnapshot) -> String {
    let completed: usize = snap.vaults.iter().map(|c| c.completed().count()).sum();
    let mut out = String::new();
    let _ = writeln!(out, "pairs scanned:   {}", snap.scanned.len());
    let _ = writeln!(out, "pairs failed:    {}", snap.failures.len());
    let _ = writeln!(out, "vaults:          {}", snap.vaults.len());
    let _ = writeln!(out, "recovery points: {} ({completed} completed)", snap.point_count());
    let _ = writeln!(out, "total size:      {}", format_bytes(snap.total_backup_size_bytes()));
    for f in &snap.failures {
        let _ = writeln!(out, "FAILED {}/{}: {}", f.account, f.region, f.reason);
    }
    out
}

fn inventory_table(snap: &InventorySnapshot) -> String {
    let now = snap.taken_at;
    let mut out = String::new();
    for c in &snap.vaults {
        let _ = writeln!(
            out,
            "{} ({}/{}) points={} size={}",
            c.vault.name,
            c.vault.account_id,
            c.vault.region,
            c.recovery_points.len(),
            format_bytes(c.total_backup_size_bytes())
        );
        for rp in &c.recovery_points {
            let size = rp
                .backup_size_bytes
                .map(format_bytes)
                .unwrap_or_else(|| "-".into());
            let _ = writeln!(
                out,
                "  {:<10} {:<8} {}  {:>4}d  {:>10}  {}",
                rp.status.as_str(),
                rp.resource_type,
                ts(&rp.creation_time),
                rp.age_days(now),
                size,
                rp.arn
            );
        }
    }
    for f in &snap.failures {
        let _ = writeln!(out, "FAILED {}/{}: {}", f.account, f.region, f.reason);
    }
    if snap.vaults.is_empty() && snap.failures.is_empty() {
        out.push_str("no vaults found\n");
    }
    out
}

pub fn plan(plan: &MigrationPlan) -> String {
    let mut out = String::new();
    for (i, t) in plan.tasks.iter().enumerate() {
        let _ = write!(
            out,
            "{:>4}. {:<8} {}  {} -> {} ({})",
            i + 1,
            t.status.as_str(),
            ts(&t.creation_time),
            t.key.source_arn,
            t.key.destination_vault,
            t.destination_region
        );
        if let Some(r) = &t.reason {
            let _ = write!(out, "  [{r}]");
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "copies: {}  skipped: {}  already present: {}  excluded: {}",
        plan.count(TaskStatus::Pending),
        plan.count(TaskStatus::Skipped),
        plan.already_present,
        plan.excluded.len()
    );
    out
}

pub fn run_summary(s: &RunSummary, interrupted: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "succeeded: {}  failed: {}  skipped: {}  unfinished: {}",
        s.succeeded, s.failed, s.skipped, s.unfinished
    );
    for f in &s.failures {
        let _ = writeln!(out, "FAILED {}: {}", f.key, f.error);
    }
    if interrupted {
        out.push_str("interrupted: rerun `copy` to resume from the checkpoint\n");
    }
    out
}

pub fn verification(r: &VerificationReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "checked: {}  verified: {}  mismatches: {}",
        r.checked,
        r.verified,
        r.mismatches.len()
    );
    for m in &r.mismatches {
        let _ = writeln!(out, "{:<18} {}: {}", m.kind.as_str(), m.key, m.detail);
    }
    out
}

pub fn status(state: &CheckpointState) -> String {
    let mut out = String::new();
    if state.tasks.is_empty() {
        out.push_str("no checkpointed tasks\n");
        return out;
    }
    for rec in state.tasks.values() {
        let _ = write!(
            out,
            "{:<12} attempts={:<2} {} -> {}",
            rec.status.as_str(),
            rec.attempt_count,
            rec.source_arn,
            rec.destination_vault
        );
        if let Some(job) = &rec.job_handle {
            let _ = write!(out, "  job={}", job.job_id);
        }
        if let Some(e) = &rec.last_error {
            let _ = write!(out, "  [{e}]");
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "succeeded: {}  in progress: {}  pending: {}  failed: {}  skipped: {}",
        state.count(TaskStatus::Succeeded),
        state.count(TaskStatus::InProgress),
        state.count(TaskStatus::Pending),
        state.count(TaskStatus::Failed),
        state.count(TaskStatus::Skipped)
    );
    out
}
