//! Run lifecycle: cooperative cancellation, wall clock, scratch directory.
//!
//! A [`RunControl`] is cheap to clone and shares one cancel flag, so a
//! caller can keep a handle and cancel a run that is executing elsewhere.
//! The pipeline calls [`RunControl::check`] at its suspension points
//! (between resources, between fetch and parse, between chapters) and
//! while an HTTP retry is backing off.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    #[error("run was cancelled")]
    Cancelled,
    #[error("run exceeded its wall clock")]
    TimedOut,
}

#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the run once `limit` has elapsed from now.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.deadline = Some(Instant::now() + limit);
        self
    }

    /// `[run] wall_clock_secs`; 0 disables the deadline.
    pub fn with_wall_clock_secs(self, secs: u64) -> Self {
        if secs == 0 {
            self
        } else {
            self.with_timeout(Duration::from_secs(secs))
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Interrupt> {
        if self.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupt::TimedOut),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Succeeded,
    Cancelled,
    Failed,
}

/// Scoped `working_dir/{key}` directory.
///
/// Removed on drop after success or cancellation. After a failure, or when
/// dropped without an outcome (an early `?` return), it is kept only if
/// `retain_on_failure` is set.
#[derive(Debug)]
pub struct WorkingDir {
    path: PathBuf,
    retain_on_failure: bool,
    outcome: Outcome,
}

impl WorkingDir {
    /// Create a fresh directory, clearing whatever a previous run left.
    pub fn create(root: &Path, key: &str, retain_on_failure: bool) -> io::Result<Self> {
        let path = root.join(key);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(path.join("sources"))?;
        Ok(Self {
            path,
            retain_on_failure,
            outcome: Outcome::Pending,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unpacked assets live here.
    pub fn sources(&self) -> PathBuf {
        self.path.join("sources")
    }

    pub fn succeed(mut self) {
        self.outcome = Outcome::Succeeded;
    }

    pub fn cancelled(mut self) {
        self.outcome = Outcome::Cancelled;
    }

    pub fn fail(mut self) {
        self.outcome = Outcome::Failed;
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        let keep = matches!(self.outcome, Outcome::Failed | Outcome::Pending) && self.retain_on_failure;
        if keep {
            tracing::info!(path = %self.path.display(), "keeping working directory");
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not remove working directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fresh_control_passes() {
        assert_eq!(RunControl::new().check(), Ok(()));
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let control = RunControl::new();
        let handle = control.clone();
        handle.cancel();
        assert!(control.is_cancelled());
        assert_eq!(control.check(), Err(Interrupt::Cancelled));
    }

    #[test]
    fn expired_deadline_times_out() {
        let control = RunControl::new().with_timeout(Duration::ZERO);
        assert_eq!(control.check(), Err(Interrupt::TimedOut));
    }

    #[test]
    fn zero_wall_clock_disables_deadline() {
        let control = RunControl::new().with_wall_clock_secs(0);
        assert_eq!(control.check(), Ok(()));
    }

    #[test]
    fn cancel_wins_over_deadline() {
        let control = RunControl::new().with_timeout(Duration::ZERO);
        control.cancel();
        assert_eq!(control.check(), Err(Interrupt::Cancelled));
    }

    #[test]
    fn working_dir_removed_on_success() {
        let tmp = TempDir::new().unwrap();
        let dir = WorkingDir::create(tmp.path(), "abc", true).unwrap();
        let path = dir.path().to_path_buf();
        assert!(dir.sources().is_dir());
        dir.succeed();
        assert!(!path.exists());
    }

    #[test]
    fn working_dir_removed_on_cancel_even_when_retaining() {
        let tmp = TempDir::new().unwrap();
        let dir = WorkingDir::create(tmp.path(), "abc", true).unwrap();
        let path = dir.path().to_path_buf();
        dir.cancelled();
        assert!(!path.exists());
    }

    #[test]
    fn working_dir_retained_on_failure() {
        let tmp = TempDir::new().unwrap();
        let dir = WorkingDir::create(tmp.path(), "abc", true).unwrap();
        let path = dir.path().to_path_buf();
        dir.fail();
        assert!(path.exists());

        let dir = WorkingDir::create(tmp.path(), "abc", false).unwrap();
        dir.fail();
        assert!(!path.exists());
    }

    #[test]
    fn dropped_without_outcome_counts_as_failure() {
        let tmp = TempDir::new().unwrap();
        let path = {
            let dir = WorkingDir::create(tmp.path(), "abc", true).unwrap();
            dir.path().to_path_buf()
        };
        assert!(path.exists());
    }

    #[test]
    fn create_clears_stale_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("abc/sources/old")).unwrap();
        let dir = WorkingDir::create(tmp.path(), "abc", false).unwrap();
        assert!(!dir.sources().join("old").exists());
    }
}
