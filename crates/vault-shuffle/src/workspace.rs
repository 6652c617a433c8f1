use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{Error, Result};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const SOURCE_INVENTORY_FILE: &str = "inventory-source.json";
pub const DESTINATION_INVENTORY_FILE: &str = "inventory-destination.json";
pub const PLAN_FILE: &str = "plan.json";
pub const VERIFICATION_FILE: &str = "verification.json";
pub const LOCK_FILE: &str = ".run.lock";

const LOCK_WAIT: Duration = Duration::from_secs(5);

/// The state directory a run reads and writes its artifacts in.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Resolve `state_dir`: absolute paths are taken as-is, relative ones are
    /// rooted at `base` (the config file's directory, or the cwd).
    pub fn resolve(base: &Path, state_dir: &str) -> Result<Self> {
        let raw = state_dir.trim();
        if raw.is_empty() {
            return Err(Error::config("state_dir must not be empty"));
        }
        let p = Path::new(raw);
        if p.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::config(format!(
                "state_dir must not contain '..': {raw}"
            )));
        }
        let root = if p.is_absolute() {
            p.to_path_buf()
        } else {
            base.join(p)
        };
        Ok(Self { root })
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", self.root.display())))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn source_inventory_path(&self) -> PathBuf {
        self.root.join(SOURCE_INVENTORY_FILE)
    }

    pub fn destination_inventory_path(&self) -> PathBuf {
        self.root.join(DESTINATION_INVENTORY_FILE)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join(PLAN_FILE)
    }

    pub fn verification_path(&self) -> PathBuf {
        self.root.join(VERIFICATION_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Exclusive run lock; released when the guard drops.
    pub fn lock(&self) -> Result<RunLock> {
        self.ensure()?;
        RunLock::acquire(&self.lock_path(), LOCK_WAIT)
    }
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let deadline = Instant::now() + wait;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut f) => {
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = holder_pid(path)
                        && !process_alive(pid)
                    {
                        warn!(lock = %path.display(), pid, "removing run lock left by a dead process");
                        match fs::remove_file(path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => {
                                return Err(Error::msg(format!(
                                    "failed to remove stale run lock {}: {e}",
                                    path.display()
                                )));
                            }
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::msg(format!(
                            "another run holds {} (remove it if no run is active)",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::msg(format!(
                        "failed to acquire run lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }
}

/// Remove the lock at `path` if this process holds it. For exit paths that
/// skip destructors.
pub fn release_if_owned(path: &Path) {
    if holder_pid(path) == Some(std::process::id()) {
        let _ = fs::remove_file(path);
    }
}

fn holder_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks for existence; EPERM means it exists under another user.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Write via temp file, fsync, rename, then fsync the directory. Readers
/// never observe a torn file.
pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    {
        let mut f = fs::File::create(&tmp)
            .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
        f.write_all(body.as_bytes())
            .and_then(|_| f.sync_all())
            .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    sync_parent_dir(path)
}

/// Make the rename itself durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    fs::File::open(parent)
        .and_then(|d| d.sync_all())
        .map_err(|e| Error::msg(format!("failed to sync directory {}: {e}", parent.display())))
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| Error::msg(format!("failed to encode {}: {e}", path.display())))?;
    atomic_write_text(path, &body)
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::msg(format!("failed to parse {}: {e}", path.display())))
}
