//! Scoped exclusive access to the datawarehouse.
//!
//! Two lock files live in the datawarehouse root:
//!
//! - `.cs.lock` admits a single synchronization job. It is taken without
//!   blocking (bounded polling) and holds the pid of the job.
//! - `.lock` guards the published tree. Readers such as a dashboard take it
//!   shared; the job takes it shared while copying out and exclusive while
//!   publishing.
//!
//! A job works on a private staged copy and only touches the published tree
//! in [`ExclusiveWorkspace::publish`].

use crate::{Result, SyncError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub const RUN_LOCK_FILE: &str = ".cs.lock";
pub const PUBLISH_LOCK_FILE: &str = ".lock";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeouts {
    pub run: Duration,
    pub copy_out: Duration,
    pub publish: Duration,
}

impl Default for LockTimeouts {
    fn default() -> Self {
        Self {
            run: Duration::from_secs(1),
            copy_out: Duration::from_secs(1),
            publish: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Files never staged nor published: logs, their rotated backups and lock
/// files
pub fn is_ignored(name: &str) -> bool {
    name.ends_with(".log") || name.contains(".log.") || name.starts_with(".lock") || name == RUN_LOCK_FILE
}

pub struct ExclusiveWorkspace {
    root: PathBuf,
    run_lock: File,
    staged: TempDir,
    timeouts: LockTimeouts,
}

impl ExclusiveWorkspace {
    pub fn acquire(root: &Path) -> Result<Self> {
        Self::acquire_with(root, LockTimeouts::default())
    }

    /// Take the run lock and stage a copy of `root`.
    ///
    /// Fails with [`SyncError::AlreadyRunning`] when another job holds the run
    /// lock for longer than `timeouts.run`.
    pub fn acquire_with(root: &Path, timeouts: LockTimeouts) -> Result<Self> {
        fs::create_dir_all(root)?;

        let run_lock_path = root.join(RUN_LOCK_FILE);
        let mut run_lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&run_lock_path)?;

        if !lock_within(&run_lock, LockMode::Exclusive, timeouts.run)? {
            return Err(SyncError::AlreadyRunning {
                pid: read_holder_pid(&run_lock_path),
            });
        }

        let staged = tempfile::Builder::new().prefix("datawarehouse_").tempdir()?;

        run_lock.set_len(0)?;
        run_lock.seek(SeekFrom::Start(0))?;
        writeln!(run_lock, "{}", std::process::id())?;
        writeln!(run_lock, "{}", staged.path().display())?;
        run_lock.flush()?;

        let workspace = Self {
            root: root.to_path_buf(),
            run_lock,
            staged,
            timeouts,
        };
        workspace.copy_out()?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staged_root(&self) -> &Path {
        self.staged.path()
    }

    fn copy_out(&self) -> Result<()> {
        let publish_lock = open_publish_lock(&self.root)?;
        if !lock_within(&publish_lock, LockMode::Shared, self.timeouts.copy_out)? {
            return Err(SyncError::LockTimeout(format!(
                "could not read-lock {}",
                self.root.display()
            )));
        }

        copy_tree(&self.root, self.staged.path())?;
        FileExt::unlock(&publish_lock)?;
        debug!(staged = %self.staged.path().display(), "Staged datawarehouse copy");
        Ok(())
    }

    /// Copy the staged tree over the published one under the exclusive
    /// publish lock. Entries deleted while staged are deleted from the
    /// published tree too.
    pub fn publish(self) -> Result<()> {
        let publish_lock = open_publish_lock(&self.root)?;
        if !lock_within(&publish_lock, LockMode::Exclusive, self.timeouts.publish)? {
            return Err(SyncError::LockTimeout(format!(
                "could not write-lock {}",
                self.root.display()
            )));
        }

        prune_missing(self.staged.path(), &self.root)?;
        copy_tree(self.staged.path(), &self.root)?;
        FileExt::unlock(&publish_lock)?;
        info!(root = %self.root.display(), "Published datawarehouse");
        Ok(())
    }
}

impl Drop for ExclusiveWorkspace {
    fn drop(&mut self) {
        if let Err(e) = self.run_lock.set_len(0) {
            warn!(error = %e, "Could not clear run lock");
        }
        let _ = FileExt::unlock(&self.run_lock);
    }
}

/// Run `f` on a staged copy of `root` and publish only if it succeeds
pub fn with_exclusive_run<T, F>(root: &Path, f: F) -> Result<T>
where
    F: FnOnce(&Path) -> Result<T>,
{
    let workspace = ExclusiveWorkspace::acquire(root)?;
    let out = f(workspace.staged_root())?;
    workspace.publish()?;
    Ok(out)
}

fn open_publish_lock(root: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(root.join(PUBLISH_LOCK_FILE))?)
}

/// Poll a non-blocking lock until `timeout`; false on contention
fn lock_within(file: &File, mode: LockMode, timeout: Duration) -> Result<bool> {
    let start = Instant::now();
    loop {
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        };

        match attempt {
            Ok(()) => return Ok(true),
            Err(e) if is_contended(&e) => {
                if start.elapsed() >= timeout {
                    return Ok(false);
                }
                thread::sleep(LOCK_POLL_INTERVAL.min(timeout));
            }
            Err(e) => return Err(SyncError::Io(e)),
        }
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn read_holder_pid(path: &Path) -> Option<u32> {
    let mut content = String::new();
    File::open(path).ok()?.read_to_string(&mut content).ok()?;
    content.lines().next()?.trim().parse().ok()
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_ignored(&name.to_string_lossy()) {
            continue;
        }

        let path = entry.path();
        let dest_path = dst.join(&name);
        if path.is_dir() {
            copy_tree(&path, &dest_path)?;
        } else {
            fs::copy(&path, &dest_path)?;
        }
    }

    Ok(())
}

/// Remove entries of `dst` that no longer exist in `src`
fn prune_missing(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(dst)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_ignored(&name.to_string_lossy()) {
            continue;
        }

        let path = entry.path();
        let counterpart = src.join(&name);
        if !counterpart.exists() {
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        } else if path.is_dir() && counterpart.is_dir() {
            prune_missing(&counterpart, &path)?;
        }
    }
    Ok(())
}
