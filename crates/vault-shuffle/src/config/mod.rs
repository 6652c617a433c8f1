use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, Result};

static REGION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2}(-[a-z]+)+-[0-9]{1,2}$").expect("region pattern is valid")
});

pub const DEFAULT_SESSION_NAME: &str = "aws-vault-shuffle";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let owned = v.clone();
        let parsed = owned.try_into().map_err(|e| {
            let at = if path.trim().is_empty() { "<root>" } else { path };
            Error::config(format!("failed to deserialize config at '{at}': {e}"))
        })?;
        Ok(Some(parsed))
    }

    /// Directory relative state paths are rooted at.
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, value: &Value) -> Result<Vec<String>> {
    let Some(arr) = value.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.trim().to_string())
                .ok_or_else(|| {
                    Error::config(format!(
                        "invalid imports entry in {} (expected string)",
                        path.display()
                    ))
                })
        })
        .filter(|r| r.as_ref().map(|s| !s.is_empty()).unwrap_or(true))
        .collect()
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path).map_err(|e| {
        Error::config(format!("failed to read config {}: {e}", path.display()))
    })?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    // `extends` is the base, then `imports` in order, then the file itself.
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    for imp in parse_imports(path, &value)? {
        let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
        merge_values(&mut out, loaded);
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
        tbl.remove("imports");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    if !path.is_file() {
        return Err(Error::config(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    if !value.is_table() {
        return Err(Error::config("configuration file must contain a TOML table"));
    }
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

pub fn validate_account(account: &str) -> Result<()> {
    if account.len() != 12 || !account.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::config(format!(
            "account must be a 12-digit number, got: '{account}'"
        )));
    }
    Ok(())
}

pub fn validate_region(region: &str) -> Result<()> {
    if !REGION_RE.is_match(region) {
        return Err(Error::config(format!("invalid region format: '{region}'")));
    }
    Ok(())
}

/// Accounts and regions a scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    accounts: BTreeSet<String>,
    regions: Vec<String>,
}

impl RegionConfig {
    pub fn new<A, R>(accounts: A, regions: R) -> Result<Self>
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let accounts: BTreeSet<String> = accounts
            .into_iter()
            .map(|a| a.into().trim().to_string())
            .collect();
        let mut regions_out: Vec<String> = Vec::new();
        for r in regions {
            let r = r.into().trim().to_string();
            if !regions_out.contains(&r) {
                regions_out.push(r);
            }
        }

        if accounts.is_empty() {
            return Err(Error::config("at least one account must be specified"));
        }
        for a in &accounts {
            validate_account(a)?;
        }
        if regions_out.is_empty() {
            return Err(Error::config("at least one region must be specified"));
        }
        for r in &regions_out {
            validate_region(r)?;
        }
        Ok(Self {
            accounts,
            regions: regions_out,
        })
    }

    /// Build from `--account` and a comma-separated `--regions` value.
    pub fn from_cli(account: &str, regions: &str) -> Result<Self> {
        let list = regions
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        Self::new([account.trim().to_string()], list)
    }

    pub fn accounts(&self) -> &BTreeSet<String> {
        &self.accounts
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Every (account, region) pair in scan order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.accounts.len() * self.regions.len());
        for a in &self.accounts {
            for r in &self.regions {
                out.push((a.clone(), r.clone()));
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VaultTarget {
    Name(String),
    Detailed {
        vault: String,
        #[serde(default)]
        region: Option<String>,
    },
}

impl VaultTarget {
    pub fn vault(&self) -> &str {
        match self {
            Self::Name(v) => v,
            Self::Detailed { vault, .. } => vault,
        }
    }

    pub fn region(&self) -> Option<&str> {
        match self {
            Self::Name(_) => None,
            Self::Detailed { region, .. } => region.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AccountAccess {
    pub profile: Option<String>,
    pub assume_role_arn: Option<String>,
    pub external_id: Option<String>,
}

fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.into()
}

fn default_call_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AwsConfig {
    pub profile: Option<String>,
    pub assume_role_arn: Option<String>,
    pub external_id: Option<String>,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// IAM role AWS Backup assumes to perform copy jobs.
    pub copy_role_arn: Option<String>,
    pub accounts: BTreeMap<String, AccountAccess>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            profile: None,
            assume_role_arn: None,
            external_id: None,
            copy_role_arn: None,
            session_name: default_session_name(),
            call_timeout_secs: default_call_timeout_secs(),
            accounts: BTreeMap::new(),
        }
    }
}

impl AwsConfig {
    pub fn has_cross_account_role(&self) -> bool {
        self.assume_role_arn.is_some()
            || self.accounts.values().any(|a| a.assume_role_arn.is_some())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub source_account: String,
    pub destination_account: String,
    pub regions: Vec<String>,
    pub vault_mapping: BTreeMap<String, VaultTarget>,
    pub concurrency_limit: usize,
    pub scan_concurrency: usize,
    pub dry_run: bool,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub poll_interval_secs: u64,
    pub state_dir: String,
    pub aws: AwsConfig,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_account: String::new(),
            destination_account: String::new(),
            regions: Vec::new(),
            vault_mapping: BTreeMap::new(),
            concurrency_limit: 4,
            scan_concurrency: 2,
            dry_run: false,
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            poll_interval_secs: 30,
            state_dir: ".vault-shuffle".into(),
            aws: AwsConfig::default(),
        }
    }
}

impl MigrationConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg: MigrationConfig = doc.deserialize_path("")?.unwrap_or_default();
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<(ConfigDoc, Self)> {
        let doc = load(path)?;
        let cfg = Self::from_doc(&doc)?;
        Ok((doc, cfg))
    }

    /// Scan scope for the source side (`list` only needs this).
    pub fn source_scope(&self) -> Result<RegionConfig> {
        if self.source_account.trim().is_empty() {
            return Err(Error::config("configuration must specify 'source_account'"));
        }
        if self.regions.is_empty() {
            return Err(Error::config("configuration must specify 'regions'"));
        }
        RegionConfig::new([self.source_account.clone()], self.regions.clone())
    }

    /// Destination regions are the configured regions plus any mapping overrides.
    pub fn destination_scope(&self) -> Result<RegionConfig> {
        if self.destination_account.trim().is_empty() {
            return Err(Error::config(
                "configuration must specify 'destination_account'",
            ));
        }
        let mut regions = self.regions.clone();
        for target in self.vault_mapping.values() {
            if let Some(r) = target.region()
                && !regions.iter().any(|x| x == r)
            {
                regions.push(r.to_string());
            }
        }
        RegionConfig::new([self.destination_account.clone()], regions)
    }

    /// Everything `copy` and `verify` need, checked before any provider call.
    pub fn validate(&self) -> Result<()> {
        self.source_scope()?;
        self.destination_scope()?;
        if self.vault_mapping.is_empty() {
            return Err(Error::config(
                "configuration must specify at least one 'vault_mapping' entry",
            ));
        }
        for (src, target) in &self.vault_mapping {
            if src.trim().is_empty() {
                return Err(Error::config("vault_mapping has an empty source vault name"));
            }
            if target.vault().trim().is_empty() {
                return Err(Error::config(format!(
                    "vault_mapping.{src} has an empty destination vault"
                )));
            }
            if let Some(r) = target.region() {
                validate_region(r)
                    .map_err(|e| e.context(format!("vault_mapping.{src}.region")))?;
            }
        }
        if self.concurrency_limit == 0 {
            return Err(Error::config("concurrency_limit must be at least 1"));
        }
        if self.scan_concurrency == 0 {
            return Err(Error::config("scan_concurrency must be at least 1"));
        }
        for account in self.aws.accounts.keys() {
            validate_account(account).map_err(|e| e.context("aws.accounts"))?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
