//! Per-container idle countdown
//!
//! Each [`IdleTimer`] owns at most one pending tokio task. Every `reset`,
//! `disarm` or `cancel` bumps a generation counter, and an expiry only counts
//! if it still carries the current generation. That turns the reset-vs-expiry
//! race into one of two outcomes: the expiry was claimed first (the freeze runs
//! and the reset opens a new window), or the reset got there first (the stale
//! expiry is dropped). It never fires twice for one countdown.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Where a container sits in its idle lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// No countdown running and not known to be frozen
    Idle,
    /// Countdown running toward a freeze
    ActiveCounting,
    /// Suspended by the gate; waits for the next request
    Frozen,
}

struct TimerState {
    generation: u64,
    pending: Option<JoinHandle<()>>,
    frozen: bool,
    closed: bool,
}

pub struct IdleTimer {
    timeout: Duration,
    state: Arc<Mutex<TimerState>>,
}

impl IdleTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(TimerState {
                generation: 0,
                pending: None,
                frozen: false,
                closed: false,
            })),
        }
    }

    /// Start a full fresh countdown, replacing any pending one.
    ///
    /// When the countdown elapses without another reset, the pending handle is
    /// cleared and `on_expiry` receives the generation to [`claim`](Self::claim).
    /// Returns false on a cancelled timer. Must be called inside a tokio runtime.
    pub fn reset<F>(&self, on_expiry: F) -> bool
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        state.generation += 1;
        if let Some(previous) = state.pending.take() {
            previous.abort();
        }

        let generation = state.generation;
        let timeout = self.timeout;
        let shared = Arc::clone(&self.state);
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if expire(&shared, generation) {
                on_expiry(generation);
            }
        }));
        true
    }

    /// Consume an expiry. True exactly once per countdown, and only if no
    /// reset, disarm or cancel happened since it was started.
    pub fn claim(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.generation != generation || state.pending.is_some() {
            return false;
        }
        state.generation += 1;
        true
    }

    /// Stop the pending countdown without closing the timer
    pub fn disarm(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }

    /// Stop the pending countdown and refuse any further resets
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.generation += 1;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }

    /// Record a completed freeze, unless a new countdown already started
    pub fn mark_frozen(&self) {
        let mut state = self.state.lock();
        if state.pending.is_none() {
            state.frozen = true;
        }
    }

    /// Record that the container is usable again
    pub fn mark_thawed(&self) {
        self.state.lock().frozen = false;
    }

    pub fn phase(&self) -> Phase {
        let state = self.state.lock();
        if state.pending.is_some() {
            Phase::ActiveCounting
        } else if state.frozen {
            Phase::Frozen
        } else {
            Phase::Idle
        }
    }

    pub fn is_counting(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().closed
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(pending) = self.state.lock().pending.take() {
            pending.abort();
        }
    }
}

fn expire(state: &Mutex<TimerState>, generation: u64) -> bool {
    let mut state = state.lock();
    if state.generation != generation {
        return false;
    }
    state.pending = None;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn arm(timer: &IdleTimer) -> mpsc::UnboundedReceiver<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        timer.reset(move |generation| {
            let _ = tx.send(generation);
        });
        rx
    }

    #[tokio::test]
    async fn test_expiry_fires_once_after_timeout() {
        let timer = IdleTimer::new(Duration::from_millis(50));
        let mut rx = arm(&timer);
        assert_eq!(timer.phase(), Phase::ActiveCounting);

        let generation = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        // Handle is cleared before anyone gets to freeze
        assert_eq!(timer.phase(), Phase::Idle);
        assert!(timer.claim(generation));
        assert!(!timer.claim(generation));

        timer.mark_frozen();
        assert_eq!(timer.phase(), Phase::Frozen);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_repeated_resets_extend_to_full_window() {
        let timer = IdleTimer::new(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..5 {
            let tx = tx.clone();
            timer.reset(move |generation| {
                let _ = tx.send(generation);
            });
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        drop(tx);

        // 200ms have passed since the first reset, but only 40ms since the last
        assert!(rx.try_recv().is_err());
        assert!(timer.is_counting());

        let fired: Vec<u64> = {
            let mut fired = Vec::new();
            while let Ok(Some(generation)) =
                tokio::time::timeout(Duration::from_millis(300), rx.recv()).await
            {
                fired.push(generation);
            }
            fired
        };
        assert_eq!(fired.len(), 1);
        assert!(timer.claim(fired[0]));
    }

    #[tokio::test]
    async fn test_reset_after_wakeup_suppresses_claim() {
        let timer = IdleTimer::new(Duration::from_millis(20));
        let mut rx = arm(&timer);
        let generation = rx.recv().await.unwrap();

        // A request lands between the wakeup and the freeze
        let _rx2 = arm(&timer);
        assert!(!timer.claim(generation));
        assert_eq!(timer.phase(), Phase::ActiveCounting);
    }

    #[tokio::test]
    async fn test_disarm_stops_countdown() {
        let timer = IdleTimer::new(Duration::from_millis(20));
        let mut rx = arm(&timer);
        timer.disarm();
        assert_eq!(timer.phase(), Phase::Idle);

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(result, Ok(None)));

        // Still usable afterwards
        let mut rx = arm(&timer);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_is_final() {
        let timer = IdleTimer::new(Duration::from_millis(20));
        let mut rx = arm(&timer);
        timer.cancel();

        assert!(timer.is_cancelled());
        assert!(!timer.reset(|_| {}));
        assert!(!timer.is_counting());
        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_mark_frozen_ignored_while_counting() {
        let timer = IdleTimer::new(Duration::from_secs(10));
        let _rx = arm(&timer);
        timer.mark_frozen();
        assert_eq!(timer.phase(), Phase::ActiveCounting);

        timer.disarm();
        timer.mark_frozen();
        assert_eq!(timer.phase(), Phase::Frozen);
        timer.mark_thawed();
        assert_eq!(timer.phase(), Phase::Idle);
    }
}
