//! Serializes concurrent installs into the same location.
//!
//! Every run registers the `(name, directory)` pairs it is about to write.
//! A second run touching any of the same pairs waits until the first has
//! released them.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// Registry of in-progress `(name, target directory)` writes.
#[derive(Debug, Default)]
pub struct InstallGate {
    in_progress: Mutex<HashMap<String, HashSet<PathBuf>>>,
    released: Notify,
}

impl InstallGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every pair, waiting while any of them is held by another run.
    ///
    /// Pairs are claimed all at once, so two runs never hold parts of each
    /// other's sets.
    pub async fn acquire_all(&self, mut pairs: Vec<(String, PathBuf)>) -> GateGuard<'_> {
        pairs.sort();
        pairs.dedup();

        let mut waited = false;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut map = self.in_progress.lock().unwrap_or_else(PoisonError::into_inner);
                let busy = pairs
                    .iter()
                    .any(|(name, dir)| map.get(name).is_some_and(|dirs| dirs.contains(dir)));
                if !busy {
                    for (name, dir) in &pairs {
                        map.entry(name.clone()).or_default().insert(dir.clone());
                    }
                    return GateGuard {
                        gate: self,
                        pairs,
                        waited,
                    };
                }
            }

            debug!(pairs = pairs.len(), "waiting for a concurrent install");
            waited = true;
            notified.await;
        }
    }

    /// Claim `pairs`, re-planning after every wait until the claim covers the plan.
    ///
    /// `replan` runs after each wait and returns the pairs the run now needs.
    /// Pairs it adds are claimed before the guard is handed out.
    ///
    /// # Errors
    /// Returns the first error from `replan`; nothing is held afterwards.
    pub async fn acquire_planned<E>(
        &self,
        pairs: Vec<(String, PathBuf)>,
        mut replan: impl FnMut() -> Result<Vec<(String, PathBuf)>, E>,
    ) -> Result<GateGuard<'_>, E> {
        let mut guard = self.acquire_all(pairs).await;
        let mut waited = false;
        while guard.waited {
            waited = true;
            let pairs = replan()?;
            if guard.covers(&pairs) {
                break;
            }
            debug!(pairs = pairs.len(), "plan grew while waiting; claiming again");
            drop(guard);
            guard = self.acquire_all(pairs).await;
        }
        guard.waited = waited;
        Ok(guard)
    }

    /// Whether `name` is being written into `dir` right now.
    #[must_use]
    pub fn is_busy(&self, name: &str, dir: &std::path::Path) -> bool {
        self.in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(|dirs| dirs.contains(dir))
    }
}

/// Held pairs. Dropping the guard releases them and wakes waiters.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a InstallGate,
    pairs: Vec<(String, PathBuf)>,
    waited: bool,
}

impl GateGuard<'_> {
    /// Whether acquiring had to wait for another run.
    #[must_use]
    pub fn waited(&self) -> bool {
        self.waited
    }

    /// Whether every pair is already held by this guard.
    #[must_use]
    pub fn covers(&self, pairs: &[(String, PathBuf)]) -> bool {
        pairs.iter().all(|p| self.pairs.binary_search(p).is_ok())
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        {
            let mut map = self
                .gate
                .in_progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for (name, dir) in &self.pairs {
                if let Some(dirs) = map.get_mut(name) {
                    dirs.remove(dir);
                    if dirs.is_empty() {
                        map.remove(name);
                    }
                }
            }
        }
        self.gate.released.notify_waiters();
    }
}
