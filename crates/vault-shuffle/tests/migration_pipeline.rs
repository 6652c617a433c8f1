use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, TimeZone, Utc};

use vault_shuffle::config::{ConfigDoc, MigrationConfig};
use vault_shuffle::model::{RecoveryPointStatus, TaskStatus, Vault};
use vault_shuffle::pipeline::{CopyOptions, Pipeline};
use vault_shuffle::provider::FakeProvider;
use vault_shuffle::provider::fake::FakeCopyOutcome;
use vault_shuffle::verify::MismatchKind;
use vault_shuffle::workspace::Workspace;

const SRC: &str = "111111111111";
const DST: &str = "222222222222";

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, d, 6, 0, 0).unwrap()
}

fn config(overrides: &str) -> MigrationConfig {
    let mut value: toml::Value = toml::from_str(&format!(
        r#"
source_account = "{SRC}"
destination_account = "{DST}"
regions = ["us-east-1"]
concurrency_limit = 2
max_retries = 2
initial_backoff_ms = 1
max_backoff_ms = 4
poll_interval_secs = 0

[vault_mapping]
daily = "dr"
"#
    ))
    .expect("parse toml");
    let extra: toml::Table = toml::from_str(overrides).expect("parse overrides");
    if let Some(t) = value.as_table_mut() {
        t.extend(extra);
    }
    let doc = ConfigDoc {
        path: PathBuf::from("<mem>"),
        value,
    };
    MigrationConfig::from_doc(&doc).expect("config")
}

struct World {
    fake: Arc<FakeProvider>,
    source: Vault,
    dest: Vault,
    _tmp: tempfile::TempDir,
    state: PathBuf,
}

impl World {
    fn new(points: u32) -> Self {
        let fake = Arc::new(FakeProvider::new());
        let source = fake.add_vault(SRC, "us-east-1", "daily");
        let dest = fake.add_vault(DST, "us-east-1", "dr");
        // Inserted newest first so ordering comes from creation time.
        for d in (1..=points).rev() {
            fake.add_recovery_point(&source, &format!("rp-{d}"), day(d), Some(u64::from(d) * 1024));
        }
        let tmp = tempfile::tempdir().expect("tempdir");
        let state = tmp.path().join("state");
        Self {
            fake,
            source,
            dest,
            _tmp: tmp,
            state,
        }
    }

    fn pipeline(&self, cfg: MigrationConfig) -> Pipeline {
        Pipeline::new(cfg, self.fake.clone(), Workspace::at(&self.state))
    }

    fn arn(&self, d: u32) -> String {
        format!("arn:aws:backup:us-east-1:{SRC}:recovery-point:rp-{d}")
    }
}

#[test]
fn three_points_copy_and_verify_cleanly() {
    let w = World::new(3);
    let out = w
        .pipeline(config(""))
        .copy(CopyOptions {
            fresh: false,
            verify: true,
        })
        .expect("copy");

    let planned: Vec<&str> = out
        .planned
        .plan
        .tasks
        .iter()
        .map(|t| t.key.source_arn.as_str())
        .collect();
    assert_eq!(planned, [w.arn(1), w.arn(2), w.arn(3)]);
    assert!(out.planned.plan.tasks.iter().all(|t| t.status == TaskStatus::Pending));

    assert_eq!(out.execution.summary.succeeded, 3);
    assert!(w.fake.max_in_flight() <= 2);
    let report = out.verification.as_ref().expect("verification ran");
    assert_eq!(report.checked, 3);
    assert!(report.mismatches.is_empty(), "{:?}", report.mismatches);
    assert!(out.is_success());

    assert_eq!(w.fake.recovery_points_in(&w.dest).len(), 3);
    assert!(w.state.join("checkpoint.json").is_file());
    assert!(w.state.join("plan.json").is_file());
    assert!(w.state.join("verification.json").is_file());
}

#[test]
fn second_run_starts_nothing() {
    let w = World::new(3);
    let first = w.pipeline(config("")).copy(CopyOptions::default()).expect("first");
    assert_eq!(first.execution.summary.succeeded, 3);
    let starts = w.fake.start_calls();

    let second = w.pipeline(config("")).copy(CopyOptions::default()).expect("second");
    assert_eq!(w.fake.start_calls(), starts);
    assert!(second.planned.plan.tasks.is_empty());
    assert_eq!(second.planned.plan.already_present, 3);
    assert!(second.is_success());
}

#[test]
fn interrupted_run_resumes_without_restarting_jobs() {
    let w = World::new(6);
    w.fake.set_polls_to_complete(50);
    let cancel = Arc::new(AtomicBool::new(false));
    w.fake.cancel_after_starts(2, cancel.clone());

    let first = w
        .pipeline(config("poll_interval_secs = 1"))
        .with_cancel(cancel)
        .copy(CopyOptions::default())
        .expect("first run");
    assert!(first.execution.interrupted);
    assert!(first.execution.summary.unfinished > 0);

    let status = w.pipeline(config("")).status().expect("status");
    assert!(status.count(TaskStatus::InProgress) > 0);

    w.fake.settle_jobs();
    let second = w
        .pipeline(config(""))
        .copy(CopyOptions {
            fresh: false,
            verify: true,
        })
        .expect("resumed run");
    assert!(!second.execution.interrupted);

    // Same outcome an uninterrupted run would give.
    let state = w.pipeline(config("")).status().expect("status");
    assert_eq!(state.count(TaskStatus::Succeeded), 6);
    assert_eq!(w.fake.recovery_points_in(&w.dest).len(), 6);

    let started = w.fake.started_sources();
    let unique: BTreeSet<&String> = started.iter().collect();
    assert_eq!(started.len(), unique.len(), "a job was started twice: {started:?}");
    assert!(second.verification.expect("verified").is_clean());
}

#[test]
fn lost_job_handles_are_restarted() {
    let w = World::new(4);
    w.fake.set_polls_to_complete(50);
    let cancel = Arc::new(AtomicBool::new(false));
    w.fake.cancel_after_starts(1, cancel.clone());
    let first = w
        .pipeline(config("poll_interval_secs = 1"))
        .with_cancel(cancel)
        .copy(CopyOptions::default())
        .expect("first run");
    assert!(first.execution.interrupted);

    w.fake.forget_jobs();
    w.fake.set_polls_to_complete(1);
    let before = w.fake.start_calls();
    let second = w.pipeline(config("")).copy(CopyOptions::default()).expect("second run");
    assert_eq!(second.execution.summary.succeeded, 4);
    assert!(second.is_success());
    // Every task starts once in the second run, including the lost one.
    assert_eq!(w.fake.start_calls() - before, 4);
}

#[test]
fn copy_that_landed_while_stopped_is_settled() {
    let w = World::new(3);
    w.fake.set_polls_to_complete(50);
    let cancel = Arc::new(AtomicBool::new(false));
    w.fake.cancel_after_starts(1, cancel.clone());
    let first = w
        .pipeline(config("concurrency_limit = 1\npoll_interval_secs = 1"))
        .with_cancel(cancel)
        .copy(CopyOptions::default())
        .expect("first run");
    assert!(first.execution.interrupted);

    let status = w.pipeline(config("")).status().expect("status");
    let stranded = status
        .tasks
        .values()
        .find(|r| r.status == TaskStatus::InProgress)
        .expect("an in-progress task")
        .clone();

    // The job finishes provider-side before the next run looks at it.
    let src = w
        .fake
        .recovery_points_in(&w.source)
        .into_iter()
        .find(|rp| rp.arn == stranded.source_arn)
        .expect("source point");
    let landed_arn = format!("arn:aws:backup:us-east-1:{DST}:recovery-point:landed");
    let mut landed = src.clone();
    landed.arn = landed_arn.clone();
    landed.account_id = DST.into();
    landed.vault_name = "dr".into();
    landed.copy_source_arn = Some(src.arn.clone());
    w.fake.insert_recovery_point(&w.dest, landed);
    w.fake.forget_jobs();
    w.fake.set_polls_to_complete(1);

    let second = w.pipeline(config("")).copy(CopyOptions::default()).expect("second run");
    assert!(second.is_success());

    let state = w.pipeline(config("")).status().expect("status");
    let rec = &state.tasks[&stranded.key().encode()];
    assert_eq!(rec.status, TaskStatus::Succeeded);
    assert_eq!(rec.destination_recovery_point_arn.as_deref(), Some(landed_arn.as_str()));
    assert_eq!(state.count(TaskStatus::InProgress), 0);
    assert_eq!(state.count(TaskStatus::Succeeded), 3);
    let starts = w
        .fake
        .started_sources()
        .iter()
        .filter(|a| **a == stranded.source_arn)
        .count();
    assert_eq!(starts, 1);

    let report = w.pipeline(config("")).verify().expect("verify");
    assert_eq!(report.checked, 3);
}

#[test]
fn dry_run_starts_nothing_and_writes_nothing() {
    let w = World::new(3);
    let out = w
        .pipeline(config("dry_run = true"))
        .copy(CopyOptions {
            fresh: false,
            verify: true,
        })
        .expect("dry run");
    assert_eq!(w.fake.start_calls(), 0);
    assert_eq!(out.execution.summary.skipped, 3);
    assert!(out.execution.tasks.iter().all(|t| t.status == TaskStatus::Skipped));
    assert!(out.verification.is_none());
    assert!(!w.state.exists());
}

#[test]
fn permanent_failure_does_not_stop_the_batch() {
    let w = World::new(3);
    w.fake.script_copy(
        &w.arn(2),
        vec![FakeCopyOutcome::StartDenied(
            "AccessDeniedException: not authorized to perform backup:StartCopyJob".into(),
        )],
    );
    let out = w.pipeline(config("")).copy(CopyOptions::default()).expect("copy");
    assert_eq!(out.execution.summary.succeeded, 2);
    assert_eq!(out.execution.summary.failed, 1);
    assert_eq!(out.execution.summary.failures[0].key.source_arn, w.arn(2));
    assert!(out.execution.summary.failures[0].error.contains("AccessDenied"));
    assert!(!out.is_success());
}

#[test]
fn failed_tasks_are_retried_on_the_next_run() {
    let w = World::new(2);
    w.fake.script_copy(
        &w.arn(1),
        vec![FakeCopyOutcome::JobFails("copy failed".into()); 3],
    );
    let first = w.pipeline(config("")).copy(CopyOptions::default()).expect("first");
    assert_eq!(first.execution.summary.failed, 1);
    assert_eq!(first.execution.summary.succeeded, 1);

    let second = w.pipeline(config("")).copy(CopyOptions::default()).expect("second");
    assert_eq!(second.execution.summary.succeeded, 1);
    assert_eq!(second.execution.summary.failed, 0);
    assert!(second.is_success());
}

#[test]
fn transient_job_failures_are_absorbed() {
    let w = World::new(1);
    w.fake.script_copy(
        &w.arn(1),
        vec![
            FakeCopyOutcome::JobFails("Internal failure".into()),
            FakeCopyOutcome::StartThrottled,
            FakeCopyOutcome::Succeed,
        ],
    );
    let out = w.pipeline(config("")).copy(CopyOptions::default()).expect("copy");
    assert_eq!(out.execution.summary.succeeded, 1);
    assert_eq!(out.execution.records[0].attempt_count, 2);
}

#[test]
fn region_scan_failure_is_partial() {
    let w = World::new(2);
    let west = w.fake.add_vault(SRC, "us-west-2", "daily");
    w.fake.add_recovery_point(&west, "west-1", day(1), None);
    w.fake.add_vault(DST, "us-west-2", "dr");
    w.fake.fail_pair(SRC, "us-west-2", "AccessDeniedException: explicit deny");

    let out = w
        .pipeline(config(r#"regions = ["us-east-1", "us-west-2"]"#))
        .copy(CopyOptions::default())
        .expect("copy");
    assert_eq!(out.planned.source.scanned.len(), 1);
    assert_eq!(out.planned.source.failures.len(), 1);
    assert_eq!(out.planned.source.failures[0].region, "us-west-2");
    assert_eq!(out.execution.summary.succeeded, 2);
    assert!(!out.is_success());
}

#[test]
fn ambiguous_destination_matches_are_skipped() {
    let w = World::new(1);
    let src = w
        .fake
        .recovery_points_in(&w.source)
        .pop()
        .expect("source point");
    for id in ["d1", "d2"] {
        let mut twin = src.clone();
        twin.arn = format!("arn:aws:backup:us-east-1:{DST}:recovery-point:{id}");
        twin.account_id = DST.into();
        twin.vault_name = "dr".into();
        w.fake.insert_recovery_point(&w.dest, twin);
    }

    let out = w.pipeline(config("")).copy(CopyOptions::default()).expect("copy");
    assert_eq!(w.fake.start_calls(), 0);
    assert_eq!(out.execution.summary.skipped, 1);
    let t = &out.execution.tasks[0];
    assert_eq!(t.status, TaskStatus::Skipped);
    assert!(t.reason.as_deref().unwrap_or_default().starts_with("ambiguous"));
}

#[test]
fn missing_destination_vault_aborts_before_copying() {
    let w = World::new(2);
    let mut cfg = config("");
    cfg.vault_mapping.insert(
        "daily".into(),
        vault_shuffle::config::VaultTarget::Name("missing".into()),
    );
    let err = w.pipeline(cfg).copy(CopyOptions::default()).unwrap_err();
    assert!(err.is_config(), "{err}");
    assert_eq!(w.fake.start_calls(), 0);
}

#[test]
fn verify_from_saved_state_reports_drift() {
    let w = World::new(2);
    w.pipeline(config("")).copy(CopyOptions::default()).expect("copy");
    assert!(w.pipeline(config("")).verify().expect("verify").is_clean());

    let landed = w.fake.recovery_points_in(&w.dest);
    w.fake.set_size(&landed[0].arn, Some(1));
    w.fake.set_status(&landed[1].arn, RecoveryPointStatus::Deleting);

    let report = w.pipeline(config("")).verify().expect("verify");
    let kinds: Vec<MismatchKind> = report.mismatches.iter().map(|m| m.kind).collect();
    assert_eq!(report.checked, 2);
    assert_eq!(report.verified, 0);
    assert!(kinds.contains(&MismatchKind::SizeMismatch));
    assert!(kinds.contains(&MismatchKind::NotCompleted));
}

#[test]
fn verify_without_a_checkpoint_is_an_error() {
    let w = World::new(1);
    let err = w.pipeline(config("")).verify().unwrap_err();
    assert!(err.to_string().contains("no checkpoint found"), "{err}");
}

#[test]
fn verify_after_a_rerun_still_checks_every_copy() {
    let w = World::new(3);
    w.pipeline(config("")).copy(CopyOptions::default()).expect("first");
    let rerun = w.pipeline(config("")).copy(CopyOptions::default()).expect("second");
    assert!(rerun.planned.plan.tasks.is_empty());

    let report = w.pipeline(config("")).verify().expect("verify");
    assert_eq!(report.checked, 3);
    assert_eq!(report.verified, 3);
    assert!(report.is_clean(), "{:?}", report.mismatches);

    let landed = w.fake.recovery_points_in(&w.dest);
    w.fake.set_size(&landed[0].arn, Some(1));
    let report = w.pipeline(config("")).verify().expect("verify");
    assert_eq!(report.checked, 3);
    assert_eq!(report.mismatches.len(), 1);
}

#[test]
fn list_pages_through_everything_for_any_page_size() {
    let w = World::new(7);
    for size in [1, 2, 3, 6, 7, 50] {
        w.fake.set_page_size(size);
        w.fake.repeat_page_boundary(size % 2 == 1);
        let snap = w.pipeline(config("")).list(
            &vault_shuffle::config::RegionConfig::from_cli(SRC, "us-east-1").expect("scope"),
        );
        assert!(snap.is_complete());
        assert_eq!(snap.point_count(), 7, "page size {size}");
    }
}

#[test]
fn fresh_discards_checkpointed_progress() {
    let w = World::new(1);
    w.pipeline(config("")).copy(CopyOptions::default()).expect("copy");
    let out = w
        .pipeline(config(""))
        .copy(CopyOptions {
            fresh: true,
            verify: false,
        })
        .expect("fresh copy");
    // The copy is still at the destination, so nothing is replanned.
    assert!(out.planned.plan.tasks.is_empty());
    let state = w.pipeline(config("")).status().expect("status");
    assert!(state.tasks.is_empty());
}

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, body).expect("write config");
    p
}

#[test]
fn config_file_with_extends_resolves_state_dir_next_to_it() {
    let tmp = tempfile::tempdir().expect("tempdir");
    write(
        tmp.path(),
        "base.toml",
        &format!(
            r#"
source_account = "{SRC}"
destination_account = "{DST}"
regions = ["us-east-1"]
"#
        ),
    );
    let main = write(
        tmp.path(),
        "prod.toml",
        r#"
extends = "base.toml"
state_dir = "shuffle-state"

[vault_mapping]
daily = { vault = "dr", region = "us-west-2" }
"#,
    );
    let (doc, cfg) = MigrationConfig::load(&main).expect("load");
    cfg.validate().expect("valid");
    assert_eq!(cfg.source_account, SRC);
    assert_eq!(cfg.vault_mapping["daily"].region(), Some("us-west-2"));
    let regions = cfg.destination_scope().expect("scope");
    assert_eq!(regions.regions(), ["us-east-1", "us-west-2"]);

    let ws = Workspace::resolve(&doc.base_dir(), &cfg.state_dir).expect("workspace");
    assert_eq!(ws.root(), tmp.path().join("shuffle-state"));
}
