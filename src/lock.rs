//! Host-local single-instance lock.
//!
//! A lock record is a file named `<name>.lock` in a shared directory (the host
//! temp directory by default) holding the owner's PID as decimal text. A
//! record whose PID no longer identifies a live process is stale and may be
//! reclaimed by the next process that asks for the lock.
//!
//! Acquisition inspects, reclaims and creates the record while holding an
//! exclusive `flock` on a sibling `.<name>.lock.claim` file, so two processes
//! that find the same stale or corrupt record cannot both end up owning it.
//! Claim files are left in place; removing them would reopen the race.

use crate::config::LockConfig;
use crate::error::LockError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// How a record that cannot be read or parsed is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptRecordPolicy {
    /// Delete the record and take the lock
    #[default]
    Reclaim,
    /// Report the lock as held by an unknown owner
    TreatAsBusy,
}

/// How the liveness of a recorded PID is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessPolicy {
    /// Ask the OS whether the process exists (`kill(pid, 0)` on Unix)
    Probe,
    /// Never consider a recorded owner dead
    AssumeAlive,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        if cfg!(unix) {
            LivenessPolicy::Probe
        } else {
            LivenessPolicy::AssumeAlive
        }
    }
}

/// What is currently stored at a lock path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Record {
    Absent,
    Live(u32),
    Stale(u32),
    Corrupt,
    Unreadable,
}

/// Acquires and inspects lock records in one directory
#[derive(Debug, Clone)]
pub struct LockGuard {
    dir: PathBuf,
    corrupt_record: CorruptRecordPolicy,
    liveness: LivenessPolicy,
}

impl Default for LockGuard {
    fn default() -> Self {
        Self::in_dir(std::env::temp_dir())
    }
}

impl LockGuard {
    /// Guard rooted in the host temp directory with default policies
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard rooted in a specific directory
    pub fn in_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            corrupt_record: CorruptRecordPolicy::default(),
            liveness: LivenessPolicy::default(),
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        let dir = config
            .dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self::in_dir(dir)
            .with_corrupt_record_policy(config.corrupt_record)
            .with_liveness_policy(config.liveness)
    }

    pub fn with_corrupt_record_policy(mut self, policy: CorruptRecordPolicy) -> Self {
        self.corrupt_record = policy;
        self
    }

    pub fn with_liveness_policy(mut self, policy: LivenessPolicy) -> Self {
        self.liveness = policy;
        self
    }

    /// Lock file location for `name`. Pure; nothing is created.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.lock", file_name))
    }

    /// Take the lock for `name`, reclaiming a stale record if one is found.
    ///
    /// Fails with [`LockError::Busy`] when a live process owns the record or
    /// when a concurrent process created it first.
    pub fn acquire(&self, name: &str) -> Result<LockHandle, LockError> {
        let path = self.lock_path(name);
        let _claim = ClaimGuard::take(&path).map_err(|source| LockError::Io {
            path: claim_path(&path),
            source,
        })?;
        self.acquire_claimed(path)
    }

    /// Inspect, reclaim and create. Callers hold the claim for `path`.
    fn acquire_claimed(&self, path: PathBuf) -> Result<LockHandle, LockError> {
        match self.inspect(&path) {
            Record::Absent => {}
            Record::Live(pid) => {
                debug!("Lock {} held by live process {}", path.display(), pid);
                return Err(LockError::Busy {
                    path,
                    pid: Some(pid),
                });
            }
            Record::Stale(pid) => {
                info!(
                    "Reclaiming stale lock {} left by process {}",
                    path.display(),
                    pid
                );
                remove_record(&path);
            }
            Record::Corrupt | Record::Unreadable => match self.corrupt_record {
                CorruptRecordPolicy::Reclaim => {
                    warn!("Lock record {} is corrupt, reclaiming it", path.display());
                    remove_record(&path);
                }
                CorruptRecordPolicy::TreatAsBusy => {
                    warn!(
                        "Lock record {} is corrupt, treating it as held",
                        path.display()
                    );
                    return Err(LockError::Busy { path, pid: None });
                }
            },
        }

        let pid = std::process::id();
        let file = match create_record(&path, pid) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Created by a process that does not take the claim
                let pid = read_pid(&path).ok().flatten();
                debug!("Lost race for lock {}", path.display());
                return Err(LockError::Busy { path, pid });
            }
            Err(source) => return Err(LockError::Io { path, source }),
        };

        debug!("Lock {} acquired by process {}", path.display(), pid);
        Ok(LockHandle {
            file: Some(file),
            path,
            pid,
        })
    }

    /// Read-only probe: whether `name` is held by a live process, and by whom
    pub fn is_locked(&self, name: &str) -> (bool, Option<u32>) {
        match self.inspect(&self.lock_path(name)) {
            Record::Live(pid) => (true, Some(pid)),
            Record::Absent | Record::Stale(_) => (false, None),
            Record::Unreadable => (true, None),
            Record::Corrupt => match self.corrupt_record {
                CorruptRecordPolicy::Reclaim => (false, None),
                CorruptRecordPolicy::TreatAsBusy => (true, None),
            },
        }
    }

    fn inspect(&self, path: &Path) -> Record {
        match read_pid(path) {
            Ok(None) => Record::Absent,
            Ok(Some(pid)) => {
                if self.is_alive(pid) {
                    Record::Live(pid)
                } else {
                    Record::Stale(pid)
                }
            }
            Err(ReadError::Corrupt) => Record::Corrupt,
            Err(ReadError::Io(e)) => {
                warn!("Failed to read lock record {}: {}", path.display(), e);
                Record::Unreadable
            }
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        match self.liveness {
            LivenessPolicy::AssumeAlive => true,
            LivenessPolicy::Probe => process_exists(pid),
        }
    }
}

/// An acquired lock record. Dropping the handle releases it.
#[derive(Debug)]
pub struct LockHandle {
    file: Option<File>,
    path: PathBuf,
    pid: u32,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_released(&self) -> bool {
        self.file.is_none()
    }

    /// Close and delete the record. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            remove_record(&self.path);
            debug!("Lock {} released", self.path.display());
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive hold on the claim file of one lock record. Dropping it closes
/// the descriptor, which releases the `flock`.
struct ClaimGuard {
    _file: File,
}

impl ClaimGuard {
    fn take(record: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(claim_path(record))?;
        lock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

fn claim_path(record: &Path) -> PathBuf {
    let file_name = record
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    record.with_file_name(format!(".{}.claim", file_name))
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        // SAFETY: the descriptor belongs to `file`, which outlives the call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

// No advisory locking here; exclusive creation alone decides races
#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

enum ReadError {
    Corrupt,
    Io(std::io::Error),
}

fn read_pid(path: &Path) -> Result<Option<u32>, ReadError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == ErrorKind::InvalidData => return Err(ReadError::Corrupt),
        Err(e) => return Err(ReadError::Io(e)),
    };

    contents
        .trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| ReadError::Corrupt)
}

/// Create the record with its content already in place.
///
/// The PID is written to a private file which is then hard-linked to `path`,
/// so other processes never observe an empty record. Filesystems without
/// hard links fall back to an exclusive create followed by the write.
fn create_record(path: &Path, pid: u32) -> std::io::Result<File> {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{}.{}.{}.tmp", file_name, pid, seq));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp)?;
    if let Err(e) = write!(file, "{}", pid).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }

    let linked = fs::hard_link(&temp, path);
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            debug!("Hard link unavailable for {}: {}", path.display(), e);
            let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
            if let Err(e) = write!(file, "{}", pid).and_then(|_| file.flush()) {
                remove_record(path);
                return Err(e);
            }
            Ok(file)
        }
    }
}

fn remove_record(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove lock record {}: {}", path.display(), e),
    }
}

/// Whether a process with this PID exists on the host
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs the existence and permission checks only
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    true
}
