//! Cancellable pre-dispatch countdown.
//!
//! [`CountdownArmer::arm`] starts a per-second countdown on its own task. When
//! it reaches zero (or [`CountdownArmer::trigger_now`] is called) the dispatch
//! future runs exactly once for that arm cycle. [`CountdownArmer::cancel`]
//! before that point aborts the task with no side effects.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default hold time before dispatch.
pub const DEFAULT_HOLD_SECONDS: u32 = 3;

/// Where the armer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArmPhase {
    /// Nothing armed.
    #[default]
    Idle,
    /// Counting down; `remaining` whole seconds left.
    Counting {
        /// Seconds until dispatch.
        remaining: u32,
    },
    /// The dispatch future is running.
    Dispatching,
}

/// Errors reported when arming.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArmError {
    /// A countdown or dispatch is already in progress.
    #[error("a countdown is already running")]
    AlreadyArmed,
}

/// How an arm cycle ended.
#[derive(Debug)]
pub enum ArmOutcome<T> {
    /// The dispatch future completed successfully.
    Dispatched(T),
    /// The countdown was cancelled (or the armer dropped) before zero.
    Cancelled,
    /// The dispatch future failed; the armer is idle again.
    Failed(Error),
}

impl<T> ArmOutcome<T> {
    /// Whether dispatch happened and succeeded.
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched(_))
    }
}

/// Handle to one arm cycle.
#[derive(Debug)]
pub struct ArmHandle<T> {
    outcome: oneshot::Receiver<ArmOutcome<T>>,
    progress: watch::Receiver<ArmPhase>,
}

impl<T> ArmHandle<T> {
    /// Countdown progress stream.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<ArmPhase> {
        self.progress.clone()
    }

    /// Wait for the cycle to finish.
    pub async fn outcome(self) -> ArmOutcome<T> {
        self.outcome.await.unwrap_or(ArmOutcome::Cancelled)
    }
}

#[derive(Debug, Default)]
struct ArmState {
    phase: ArmPhase,
    cycle: u64,
    task: Option<JoinHandle<()>>,
    trigger: Option<Arc<Notify>>,
}

/// Single-flight countdown timer.
#[derive(Debug)]
pub struct CountdownArmer {
    state: Arc<Mutex<ArmState>>,
    progress: Arc<watch::Sender<ArmPhase>>,
}

impl Default for CountdownArmer {
    fn default() -> Self {
        Self::new()
    }
}

impl CountdownArmer {
    /// Create an idle armer.
    #[must_use]
    pub fn new() -> Self {
        let (progress, _) = watch::channel(ArmPhase::Idle);
        Self {
            state: Arc::new(Mutex::new(ArmState::default())),
            progress: Arc::new(progress),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ArmPhase {
        lock(&self.state).phase
    }

    /// Whether nothing is armed or dispatching.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.phase() == ArmPhase::Idle
    }

    /// Subscribe to phase changes.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<ArmPhase> {
        self.progress.subscribe()
    }

    /// Start a countdown of `hold_seconds`, then run `dispatch` once.
    ///
    /// A hold of zero dispatches on the next scheduler turn.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::AlreadyArmed`] if a cycle is in progress.
    pub fn arm<F, Fut, T>(&self, hold_seconds: u32, dispatch: F) -> std::result::Result<ArmHandle<T>, ArmError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut state = lock(&self.state);
        if state.phase != ArmPhase::Idle {
            return Err(ArmError::AlreadyArmed);
        }

        state.cycle += 1;
        let cycle = state.cycle;
        let trigger = Arc::new(Notify::new());
        state.phase = ArmPhase::Counting {
            remaining: hold_seconds,
        };
        state.trigger = Some(Arc::clone(&trigger));
        self.progress.send_replace(state.phase);

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(run_cycle(
            Arc::clone(&self.state),
            Arc::clone(&self.progress),
            cycle,
            hold_seconds,
            trigger,
            dispatch,
            tx,
        ));
        state.task = Some(task);

        info!(hold_seconds, "Countdown armed");
        Ok(ArmHandle {
            outcome: rx,
            progress: self.progress.subscribe(),
        })
    }

    /// Skip the rest of the countdown. Returns `false` when not counting.
    /// Repeated calls collapse into the single dispatch.
    pub fn trigger_now(&self) -> bool {
        let state = lock(&self.state);
        match (&state.phase, &state.trigger) {
            (ArmPhase::Counting { .. }, Some(trigger)) => {
                trigger.notify_one();
                debug!("Countdown triggered early");
                true
            }
            _ => false,
        }
    }

    /// Abort the countdown. Returns `false` (and does nothing) once dispatch
    /// has started or when idle.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        if !matches!(state.phase, ArmPhase::Counting { .. }) {
            return false;
        }

        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.trigger = None;
        state.phase = ArmPhase::Idle;
        self.progress.send_replace(ArmPhase::Idle);
        info!("Countdown cancelled");
        true
    }
}

impl Drop for CountdownArmer {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if matches!(state.phase, ArmPhase::Counting { .. }) {
            if let Some(task) = state.task.take() {
                task.abort();
            }
            state.phase = ArmPhase::Idle;
        }
    }
}

fn lock(state: &Mutex<ArmState>) -> MutexGuard<'_, ArmState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_cycle<F, Fut, T>(
    state: Arc<Mutex<ArmState>>,
    progress: Arc<watch::Sender<ArmPhase>>,
    cycle: u64,
    hold_seconds: u32,
    trigger: Arc<Notify>,
    dispatch: F,
    tx: oneshot::Sender<ArmOutcome<T>>,
) where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut remaining = hold_seconds;
    while remaining > 0 {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(1)) => {
                remaining -= 1;
                let mut state = lock(&state);
                if state.cycle != cycle {
                    return;
                }
                state.phase = ArmPhase::Counting { remaining };
                progress.send_replace(state.phase);
            }
            () = trigger.notified() => break,
        }
    }

    // Claim the dispatch; a cancel that won the race has already reset us.
    {
        let mut state = lock(&state);
        if state.cycle != cycle || !matches!(state.phase, ArmPhase::Counting { .. }) {
            return;
        }
        state.phase = ArmPhase::Dispatching;
        state.trigger = None;
        progress.send_replace(ArmPhase::Dispatching);
    }

    debug!(cycle, "Countdown elapsed, dispatching");
    let result = dispatch().await;

    {
        let mut state = lock(&state);
        if state.cycle == cycle {
            state.phase = ArmPhase::Idle;
            state.task = None;
        }
        progress.send_replace(ArmPhase::Idle);
    }

    let outcome = match result {
        Ok(value) => ArmOutcome::Dispatched(value),
        Err(e) => {
            debug!(error = %e, "Dispatch failed, armer back to idle");
            ArmOutcome::Failed(e)
        }
    };
    let _ = tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_dispatch(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> std::future::Ready<Result<usize>> + Send + 'static {
        let counter = Arc::clone(counter);
        move || std::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_after_hold() {
        let armer = CountdownArmer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = armer.arm(3, counting_dispatch(&count)).unwrap();

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(armer.phase(), ArmPhase::Counting { remaining: 1 });

        assert!(matches!(handle.outcome().await, ArmOutcome::Dispatched(1)));
        assert!(armer.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_zero_prevents_dispatch() {
        for hold in [1_u32, 3, 10] {
            let armer = CountdownArmer::new();
            let count = Arc::new(AtomicUsize::new(0));
            let handle = armer.arm(hold, counting_dispatch(&count)).unwrap();

            tokio::time::sleep(Duration::from_millis(u64::from(hold) * 1_000 - 500)).await;
            assert!(armer.cancel());
            assert!(matches!(handle.outcome().await, ArmOutcome::Cancelled));

            tokio::time::sleep(Duration::from_secs(u64::from(hold) + 5)).await;
            assert_eq!(count.load(Ordering::SeqCst), 0, "hold {hold}");
            assert!(armer.is_idle());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_dispatch_is_noop() {
        let armer = CountdownArmer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = armer.arm(2, counting_dispatch(&count)).unwrap();

        assert!(handle.outcome().await.is_dispatched());
        assert!(!armer.cancel());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_triggers_dispatch_once() {
        let armer = CountdownArmer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = armer.arm(30, counting_dispatch(&count)).unwrap();

        assert!(armer.trigger_now());
        armer.trigger_now();
        armer.trigger_now();

        assert!(handle.outcome().await.is_dispatched());
        assert!(!armer.trigger_now());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_while_counting_is_rejected() {
        let armer = CountdownArmer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let _handle = armer.arm(3, counting_dispatch(&count)).unwrap();

        let second = armer.arm(3, counting_dispatch(&count));
        assert!(matches!(second, Err(ArmError::AlreadyArmed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dispatch_returns_to_idle() {
        let armer = CountdownArmer::new();
        let handle = armer
            .arm(1, || async { Err::<(), _>(Error::internal("no location")) })
            .unwrap();

        assert!(matches!(handle.outcome().await, ArmOutcome::Failed(_)));
        assert!(armer.is_idle());

        let count = Arc::new(AtomicUsize::new(0));
        let handle = armer.arm(1, counting_dispatch(&count)).unwrap();
        assert!(handle.outcome().await.is_dispatched());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_counts_down() {
        let armer = CountdownArmer::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = armer.arm(3, counting_dispatch(&count)).unwrap();
        let mut progress = handle.progress();

        let mut seen = vec![*progress.borrow_and_update()];
        while progress.changed().await.is_ok() {
            let phase = *progress.borrow_and_update();
            seen.push(phase);
            if phase == ArmPhase::Idle {
                break;
            }
        }

        assert_eq!(seen.first(), Some(&ArmPhase::Counting { remaining: 3 }));
        assert!(seen.contains(&ArmPhase::Counting { remaining: 1 }));
        assert_eq!(seen.last(), Some(&ArmPhase::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_countdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = {
            let armer = CountdownArmer::new();
            armer.arm(2, counting_dispatch(&count)).unwrap()
        };

        assert!(matches!(handle.outcome().await, ArmOutcome::Cancelled));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
