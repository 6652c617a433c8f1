use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RegionConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink, NullSink};
use crate::model::{RecoveryPoint, Vault, VaultContents};
use crate::provider::BackupProvider;
use crate::retry::RetryPolicy;
use crate::sanitize::clean_message;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedPair {
    pub account: String,
    pub region: String,
    pub vaults: usize,
    pub recovery_points: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFailure {
    pub account: String,
    pub region: String,
    pub reason: String,
}

/// Normalized result of one scan. Pairs that failed are listed with a reason
/// instead of aborting the scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub taken_at: DateTime<Utc>,
    pub vaults: Vec<VaultContents>,
    pub scanned: Vec<ScannedPair>,
    pub failures: Vec<ScanFailure>,
}

impl InventorySnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            vaults: Vec::new(),
            scanned: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn pair_scanned(&self, account: &str, region: &str) -> bool {
        self.scanned
            .iter()
            .any(|p| p.account == account && p.region == region)
    }

    pub fn pair_failure(&self, account: &str, region: &str) -> Option<&ScanFailure> {
        self.failures
            .iter()
            .find(|f| f.account == account && f.region == region)
    }

    pub fn find_vault(&self, account: &str, region: &str, name: &str) -> Option<&VaultContents> {
        self.vaults.iter().find(|c| {
            c.vault.account_id == account && c.vault.region == region && c.vault.name == name
        })
    }

    pub fn get(&self, arn: &str) -> Option<&RecoveryPoint> {
        self.points().find(|rp| rp.arn == arn)
    }

    pub fn points(&self) -> impl Iterator<Item = &RecoveryPoint> {
        self.vaults.iter().flat_map(|c| c.recovery_points.iter())
    }

    pub fn point_count(&self) -> usize {
        self.vaults.iter().map(|c| c.recovery_points.len()).sum()
    }

    pub fn total_backup_size_bytes(&self) -> u64 {
        self.vaults.iter().map(|c| c.total_backup_size_bytes()).sum()
    }

    /// Fill in copy-source markers the provider does not report itself,
    /// from a destination-arn -> source-arn map. Returns how many were set.
    pub fn apply_copy_markers(&mut self, markers: &BTreeMap<String, String>) -> usize {
        let mut n = 0;
        for rp in self.vaults.iter_mut().flat_map(|c| c.recovery_points.iter_mut()) {
            if rp.copy_source_arn.is_none()
                && let Some(src) = markers.get(&rp.arn)
            {
                rp.copy_source_arn = Some(src.clone());
                n += 1;
            }
        }
        n
    }
}

pub struct InventoryEngine {
    provider: Arc<dyn BackupProvider>,
    scan_concurrency: usize,
    retry: RetryPolicy,
    sink: Arc<dyn EventSink>,
}

impl InventoryEngine {
    pub fn new(provider: Arc<dyn BackupProvider>, retry: RetryPolicy) -> Self {
        Self {
            provider,
            scan_concurrency: 2,
            retry,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_scan_concurrency(mut self, n: usize) -> Self {
        self.scan_concurrency = n.max(1);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Scan every (account, region) pair in `scope`.
    pub fn inventory(&self, scope: &RegionConfig) -> InventorySnapshot {
        let pairs = scope.pairs();
        info!(
            pairs = pairs.len(),
            workers = self.scan_concurrency,
            "inventory scan starting"
        );
        let results = fan_out(&pairs, self.scan_concurrency, |(account, region)| {
            self.scan_pair(account, region)
        });

        let mut snap = InventorySnapshot::empty();
        for ((account, region), res) in pairs.into_iter().zip(results) {
            match res {
                Ok(contents) => {
                    let points = contents.iter().map(|c| c.recovery_points.len()).sum();
                    info!(%account, %region, vaults = contents.len(), recovery_points = points, "pair scanned");
                    self.sink.emit(Event::PairScanned {
                        account: account.clone(),
                        region: region.clone(),
                        vaults: contents.len(),
                        recovery_points: points,
                    });
                    snap.scanned.push(ScannedPair {
                        account,
                        region,
                        vaults: contents.len(),
                        recovery_points: points,
                    });
                    snap.vaults.extend(contents);
                }
                Err(e) => {
                    let reason = clean_message(e.message());
                    warn!(%account, %region, error = %reason, "pair scan failed");
                    self.sink.emit(Event::PairFailed {
                        account: account.clone(),
                        region: region.clone(),
                        reason: reason.clone(),
                    });
                    snap.failures.push(ScanFailure {
                        account,
                        region,
                        reason,
                    });
                }
            }
        }
        snap.taken_at = Utc::now();
        snap
    }

    /// Re-list specific vaults. Each entry is the vault's contents or the
    /// reason it could not be listed.
    pub fn scan_vaults(&self, vaults: &[Vault]) -> Vec<(Vault, Result<VaultContents>)> {
        let results = fan_out(vaults, self.scan_concurrency, |v| {
            self.list_all_points(v).map(|recovery_points| VaultContents {
                vault: v.clone(),
                recovery_points,
            })
        });
        vaults.iter().cloned().zip(results).collect()
    }

    fn scan_pair(&self, account: &str, region: &str) -> Result<Vec<VaultContents>> {
        let what = format!("list vaults in {account}/{region}");
        let mut vaults = self
            .retry
            .run(&what, || self.provider.list_vaults(account, region))?;
        vaults.sort_by(|a, b| a.name.cmp(&b.name));
        vaults.dedup_by(|a, b| a.arn == b.arn);

        let mut out = Vec::with_capacity(vaults.len());
        for vault in vaults {
            let recovery_points = self.list_all_points(&vault)?;
            debug!(%account, %region, vault = %vault.name, points = recovery_points.len(), "vault listed");
            out.push(VaultContents {
                vault,
                recovery_points,
            });
        }
        Ok(out)
    }

    /// Walk every page of a vault's listing, dropping arns already seen.
    fn list_all_points(&self, vault: &Vault) -> Result<Vec<RecoveryPoint>> {
        let what = format!("list recovery points in {}", vault.arn);
        let mut seen: HashSet<String> = HashSet::new();
        let mut tokens: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.retry.run(&what, || {
                self.provider.list_recovery_points(
                    &vault.name,
                    &vault.account_id,
                    &vault.region,
                    token.as_deref(),
                )
            })?;
            for rp in page.items {
                if seen.insert(rp.arn.clone()) {
                    out.push(rp);
                }
            }
            match page.next_token {
                None => break,
                Some(t) => {
                    if !tokens.insert(t.clone()) {
                        return Err(Error::permanent(format!(
                            "{what}: provider repeated continuation token '{t}'"
                        )));
                    }
                    token = Some(t);
                }
            }
        }
        out.sort_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then_with(|| a.arn.cmp(&b.arn))
        });
        Ok(out)
    }
}

/// Run `f` over `items` on at most `workers` threads, keeping input order.
fn fan_out<T, R, F>(items: &[T], workers: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, R)>();
    std::thread::scope(|s| {
        for _ in 0..workers.clamp(1, items.len()) {
            let tx = tx.clone();
            let next = &next;
            let f = &f;
            s.spawn(move || {
                loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(item) = items.get(i) else {
                        break;
                    };
                    if tx.send((i, f(item))).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
    for (i, r) in rx {
        slots[i] = Some(r);
    }
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FakeProvider;
    use chrono::TimeZone;
    use std::time::Duration;

    const SRC: &str = "111111111111";

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[test]
    fn fan_out_keeps_input_order() {
        let items: Vec<u32> = (0..20).collect();
        let out = fan_out(&items, 4, |n| n * 10);
        assert_eq!(out, (0..20).map(|n| n * 10).collect::<Vec<_>>());
    }

    #[test]
    fn boundary_repeats_are_deduplicated() {
        let fake = Arc::new(FakeProvider::new());
        let v = fake.add_vault(SRC, "us-east-1", "daily");
        for d in 1..=7 {
            fake.add_recovery_point(&v, &format!("rp{d}"), t(d), Some(1));
        }
        fake.set_page_size(3);
        fake.repeat_page_boundary(true);

        let engine = InventoryEngine::new(fake.clone(), fast_retry());
        let scope = RegionConfig::new([SRC], ["us-east-1"]).unwrap();
        let snap = engine.inventory(&scope);
        assert!(snap.is_complete());
        assert_eq!(snap.point_count(), 7);
        assert_eq!(fake.list_page_calls(), 3);
    }

    #[test]
    fn throttled_pages_are_retried() {
        let fake = Arc::new(FakeProvider::new());
        let v = fake.add_vault(SRC, "us-east-1", "daily");
        fake.add_recovery_point(&v, "a", t(1), None);
        fake.throttle_pair(SRC, "us-east-1", 2);

        let engine = InventoryEngine::new(fake, fast_retry());
        let snap = engine.inventory(&RegionConfig::new([SRC], ["us-east-1"]).unwrap());
        assert!(snap.is_complete(), "{:?}", snap.failures);
        assert_eq!(snap.point_count(), 1);
    }

    #[test]
    fn copy_markers_fill_only_missing_sources() {
        let fake = Arc::new(FakeProvider::new());
        let v = fake.add_vault(SRC, "us-east-1", "daily");
        let a = fake.add_recovery_point(&v, "a", t(1), None);
        let engine = InventoryEngine::new(fake, fast_retry());
        let mut snap = engine.inventory(&RegionConfig::new([SRC], ["us-east-1"]).unwrap());

        let mut markers = BTreeMap::new();
        markers.insert(a.arn.clone(), "arn:source".to_string());
        assert_eq!(snap.apply_copy_markers(&markers), 1);
        assert_eq!(
            snap.get(&a.arn).unwrap().copy_source_arn.as_deref(),
            Some("arn:source")
        );
        assert_eq!(snap.apply_copy_markers(&markers), 0);
    }
}
