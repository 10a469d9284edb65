// llmlb — inference gate with drain semantics
//
// Wraps every /v1 handler. While draining, new requests answer 503
// immediately; in-flight work runs to completion (or is dropped by the
// force variant). The guard releases on all exit paths.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Draining,
    Applying,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// All in-flight requests completed within the timeout.
    Completed,
    /// Timed out; this many requests were still running.
    TimedOut { remaining: u32 },
}

pub struct InferenceGate {
    accepting: AtomicBool,
    in_flight: AtomicU32,
    drained: Notify,
    state: Mutex<UpdateState>,
}

pub struct GateGuard {
    gate: Arc<InferenceGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let before = self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
        if before == 1 && !self.gate.accepting.load(Ordering::Acquire) {
            self.gate.drained.notify_waiters();
        }
    }
}

impl InferenceGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            accepting: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
            drained: Notify::new(),
            state: Mutex::new(UpdateState::Idle),
        })
    }

    /// Admit one inference request. None while draining / applying.
    pub fn try_acquire(self: &Arc<Self>) -> Option<GateGuard> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        // The flag may have flipped between the check and the increment;
        // back out so drain() never waits on us.
        if !self.accepting.load(Ordering::Acquire) {
            let before = self.in_flight.fetch_sub(1, Ordering::AcqRel);
            if before == 1 {
                self.drained.notify_waiters();
            }
            return None;
        }
        Some(GateGuard {
            gate: Arc::clone(self),
        })
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn state(&self) -> UpdateState {
        *self.state.lock().expect("gate state")
    }

    pub fn set_state(&self, state: UpdateState) {
        *self.state.lock().expect("gate state") = state;
    }

    /// Stop accepting and wait for in-flight work, up to `timeout`.
    pub async fn drain(self: &Arc<Self>, timeout: Duration) -> DrainOutcome {
        self.accepting.store(false, Ordering::Release);
        self.set_state(UpdateState::Draining);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return DrainOutcome::Completed;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let remaining = self.in_flight();
                if remaining == 0 {
                    return DrainOutcome::Completed;
                }
                return DrainOutcome::TimedOut { remaining };
            }
        }
    }

    /// Stop accepting without waiting. Returns the dropped in-flight count.
    pub fn force_drain(self: &Arc<Self>) -> u32 {
        self.accepting.store(false, Ordering::Release);
        self.set_state(UpdateState::Draining);
        self.in_flight()
    }

    /// Re-open the gate (rollback / aborted update).
    pub fn resume(self: &Arc<Self>) {
        self.accepting.store(true, Ordering::Release);
        self.set_state(UpdateState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_with_no_in_flight_completes_immediately() {
        let gate = InferenceGate::new();
        let outcome = gate.drain(Duration::from_secs(5)).await;
        assert_eq!(outcome, DrainOutcome::Completed);
        assert!(!gate.is_accepting());
        assert_eq!(gate.state(), UpdateState::Draining);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let gate = InferenceGate::new();
        let g1 = gate.try_acquire().unwrap();
        let g2 = gate.try_acquire().unwrap();
        assert_eq!(gate.in_flight(), 2);

        let gate2 = Arc::clone(&gate);
        let drain = tokio::spawn(async move { gate2.drain(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Gate already rejects while draining.
        assert!(gate.try_acquire().is_none());

        drop(g1);
        drop(g2);
        assert_eq!(drain.await.unwrap(), DrainOutcome::Completed);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_times_out_and_reports_remaining() {
        let gate = InferenceGate::new();
        let _held = gate.try_acquire().unwrap();
        let outcome = gate.drain(Duration::from_millis(50)).await;
        assert_eq!(outcome, DrainOutcome::TimedOut { remaining: 1 });
    }

    #[tokio::test]
    async fn force_drain_reports_dropped_count() {
        let gate = InferenceGate::new();
        let _a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert_eq!(gate.force_drain(), 2);
        assert!(gate.try_acquire().is_none());
    }

    #[tokio::test]
    async fn resume_reopens_gate() {
        let gate = InferenceGate::new();
        gate.force_drain();
        assert!(gate.try_acquire().is_none());
        gate.resume();
        assert!(gate.try_acquire().is_some());
        assert_eq!(gate.state(), UpdateState::Idle);
    }
}
