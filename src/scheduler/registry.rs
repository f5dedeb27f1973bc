//! Runner registry: job id to the control handle of its active runner.
//!
//! The registry is the only scheduler state shared between the command
//! surface and the runners. It is owned by a `JobController` and handed to
//! each runner it spawns; nothing about it is process-global.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Signal delivered to a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Pause,
    Cancel,
}

/// Control handle for one runner: signals plus in-flight bookkeeping.
///
/// Clones share state with the original.
#[derive(Debug, Clone)]
pub struct RunnerControl {
    runner_id: Uuid,
    job_id: Uuid,
    started_at: DateTime<Utc>,
    /// Fired by both pause and cancel.
    stop: CancellationToken,
    cancelled: Arc<AtomicBool>,
    /// Fired once the runner has exited and released its registry entry.
    finished: CancellationToken,
    /// Set when new pending work was queued for a live runner.
    wake: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl RunnerControl {
    fn new(job_id: Uuid) -> Self {
        Self {
            runner_id: Uuid::new_v4(),
            job_id,
            started_at: Utc::now(),
            stop: CancellationToken::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            finished: CancellationToken::new(),
            wake: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Unique per runner; identifies the runner as a lease owner.
    pub fn runner_id(&self) -> Uuid {
        self.runner_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Stops admissions; in-flight tasks run to completion.
    pub fn pause(&self) {
        self.stop.cancel();
    }

    /// Like `pause`, but the runner exits as cancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.stop.cancel();
    }

    /// The signal fired so far, cancel taking precedence.
    pub fn signal(&self) -> Option<Signal> {
        if !self.stop.is_cancelled() {
            None
        } else if self.cancelled.load(Ordering::SeqCst) {
            Some(Signal::Cancel)
        } else {
            Some(Signal::Pause)
        }
    }

    pub fn is_signalled(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == Some(Signal::Cancel)
    }

    /// Resolves once pause or cancel fires.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Resolves once the runner has exited.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    pub(crate) fn finish(&self) {
        self.finished.cancel();
    }

    /// Number of dispatched tasks that have not returned yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_flight(&self, count: usize) {
        self.in_flight.store(count, Ordering::SeqCst);
    }
}

/// Result of offering new pending work to a job's runner.
#[derive(Debug)]
pub enum WakeOutcome {
    /// No runner is registered.
    Idle,
    /// A live runner will pick the work up on its next iteration.
    Woken,
    /// The runner was signalled and is waiting for in-flight work.
    WindingDown(RunnerControl),
}

/// Table of active runners, at most one per job.
#[derive(Debug, Default)]
pub struct RunnerRegistry {
    runners: DashMap<Uuid, RunnerControl>,
    /// Released runners that have not finished yet, by runner id. They may
    /// still hold the job's store lease.
    exiting: DashMap<Uuid, RunnerControl>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh runner for the job.
    ///
    /// Returns `None` if one is already registered.
    pub fn register(&self, job_id: Uuid) -> Option<RunnerControl> {
        match self.runners.entry(job_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let control = RunnerControl::new(job_id);
                entry.insert(control.clone());
                Some(control)
            }
        }
    }

    pub fn get(&self, job_id: Uuid) -> Option<RunnerControl> {
        self.runners.get(&job_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.runners.contains_key(&job_id)
    }

    /// Ids of jobs with a registered runner.
    pub fn job_ids(&self) -> Vec<Uuid> {
        self.runners.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Tells the job's runner that tasks were returned to the pending pool.
    pub fn wake(&self, job_id: Uuid) -> WakeOutcome {
        match self.runners.get(&job_id) {
            None => WakeOutcome::Idle,
            Some(entry) if entry.is_signalled() => WakeOutcome::WindingDown(entry.value().clone()),
            Some(entry) => {
                entry.wake.store(true, Ordering::SeqCst);
                WakeOutcome::Woken
            }
        }
    }

    /// Removes the entry if it still belongs to `control`.
    pub(crate) fn release(&self, control: &RunnerControl) -> bool {
        self.retire(control, |current| current.runner_id == control.runner_id)
    }

    /// Like `release`, but refuses (and clears the flag) if work was queued
    /// since the runner last looked.
    pub(crate) fn release_if_idle(&self, control: &RunnerControl) -> bool {
        self.retire(control, |current| {
            current.runner_id == control.runner_id && !current.wake.swap(false, Ordering::SeqCst)
        })
    }

    /// Moves the runner from the active table to the exiting one, where it
    /// stays until `forget`. The exiting entry goes in first so the runner
    /// is always findable by one of the two.
    fn retire(
        &self,
        control: &RunnerControl,
        release: impl FnOnce(&RunnerControl) -> bool,
    ) -> bool {
        let fresh = self
            .exiting
            .insert(control.runner_id, control.clone())
            .is_none();
        let removed = self
            .runners
            .remove_if(&control.job_id, |_, current| release(current))
            .is_some();
        if !removed && fresh {
            self.exiting.remove(&control.runner_id);
        }
        removed
    }

    /// A released runner of this registry that is still shutting down.
    pub fn exiting(&self, runner_id: Uuid) -> Option<RunnerControl> {
        self.exiting
            .get(&runner_id)
            .map(|entry| entry.value().clone())
    }

    /// Drops a finished runner from the exiting table.
    pub(crate) fn forget(&self, control: &RunnerControl) {
        self.exiting.remove(&control.runner_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_at_most_once() {
        let registry = RunnerRegistry::new();
        let job_id = Uuid::new_v4();

        let control = registry.register(job_id).unwrap();
        assert!(registry.register(job_id).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.job_ids(), vec![job_id]);
        assert_eq!(control.job_id(), job_id);
    }

    #[test]
    fn test_signals() {
        let registry = RunnerRegistry::new();
        let control = registry.register(Uuid::new_v4()).unwrap();
        assert_eq!(control.signal(), None);

        control.pause();
        assert_eq!(control.signal(), Some(Signal::Pause));

        control.cancel();
        assert_eq!(control.signal(), Some(Signal::Cancel));
        assert!(control.is_cancelled());
    }

    #[test]
    fn test_signal_visible_through_registry_clone() {
        let registry = RunnerRegistry::new();
        let job_id = Uuid::new_v4();
        let control = registry.register(job_id).unwrap();

        registry.get(job_id).unwrap().pause();
        assert!(control.is_signalled());
    }

    #[test]
    fn test_release_only_own_entry() {
        let registry = RunnerRegistry::new();
        let job_id = Uuid::new_v4();
        let old = registry.register(job_id).unwrap();
        assert!(registry.release(&old));

        let new = registry.register(job_id).unwrap();
        assert!(!registry.release(&old));
        assert!(registry.contains(job_id));
        assert!(registry.release(&new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wake_blocks_idle_release_once() {
        let registry = RunnerRegistry::new();
        let job_id = Uuid::new_v4();
        let control = registry.register(job_id).unwrap();

        assert!(matches!(registry.wake(job_id), WakeOutcome::Woken));
        assert!(!registry.release_if_idle(&control));
        assert!(registry.release_if_idle(&control));
        assert!(matches!(registry.wake(job_id), WakeOutcome::Idle));
    }

    #[test]
    fn test_wake_reports_winding_down() {
        let registry = RunnerRegistry::new();
        let job_id = Uuid::new_v4();
        let control = registry.register(job_id).unwrap();
        control.pause();

        assert!(matches!(
            registry.wake(job_id),
            WakeOutcome::WindingDown(_)
        ));
    }

    #[test]
    fn test_released_runner_is_exiting_until_forgotten() {
        let registry = RunnerRegistry::new();
        let job_id = Uuid::new_v4();
        let control = registry.register(job_id).unwrap();
        assert!(registry.exiting(control.runner_id()).is_none());

        assert!(registry.release_if_idle(&control));
        assert!(!registry.contains(job_id));
        assert!(registry.exiting(control.runner_id()).is_some());

        // The exit path releases again; the runner stays findable.
        assert!(!registry.release(&control));
        assert!(registry.exiting(control.runner_id()).is_some());

        registry.forget(&control);
        assert!(registry.exiting(control.runner_id()).is_none());
    }

    #[tokio::test]
    async fn test_finished_resolves() {
        let registry = RunnerRegistry::new();
        let control = registry.register(Uuid::new_v4()).unwrap();
        let waiter = control.clone();

        let handle = tokio::spawn(async move { waiter.finished().await });
        control.finish();
        handle.await.unwrap();
        assert!(control.is_finished());
    }
}
