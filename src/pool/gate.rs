use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::state::DedupCache;

// ---------------------------------------------------------------------------
// SlotGate: availability and cooldown shared by both pools
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GateState {
    /// Leased to a caller right now.
    busy: Vec<bool>,
    /// Taken out of rotation (browser slot solving a challenge).
    suspended: Vec<bool>,
    /// Round-robin start point for the next scan.
    cursor: usize,
}

/// Hands out slot indices. The mutex is held only for the check-and-mark step;
/// callers never hold it across I/O.
pub struct SlotGate {
    state: Mutex<GateState>,
    /// slot index → not eligible until expiry
    cooldowns: DedupCache<usize>,
    poll: Duration,
}

/// Exclusive use of one slot. Releasing is dropping; the cooldown outlives the lease.
pub struct SlotLease<'a> {
    gate: &'a SlotGate,
    index: usize,
}

impl SlotLease<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.gate.release(self.index);
    }
}

impl SlotGate {
    pub fn new(slots: usize, poll: Duration) -> Self {
        Self {
            state: Mutex::new(GateState {
                busy: vec![false; slots],
                suspended: vec![false; slots],
                cursor: 0,
            }),
            cooldowns: DedupCache::new(),
            poll,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Single non-blocking scan. `exclude` is ignored once it covers every slot.
    pub fn try_acquire(&self, exclude: &[usize], cooldown: Duration) -> Option<SlotLease<'_>> {
        let mut state = self.lock();
        let n = state.busy.len();
        if n == 0 {
            return None;
        }
        let honour_exclude = (0..n).any(|i| !exclude.contains(&i));

        for offset in 0..n {
            let i = (state.cursor + offset) % n;
            if state.busy[i] || state.suspended[i] {
                continue;
            }
            if honour_exclude && exclude.contains(&i) {
                continue;
            }
            if self.cooldowns.contains(&i) {
                continue;
            }
            state.busy[i] = true;
            state.cursor = (i + 1) % n;
            if !cooldown.is_zero() {
                self.cooldowns.set(i, cooldown);
            }
            return Some(SlotLease { gate: self, index: i });
        }
        None
    }

    /// Poll until a slot frees up. Never blocks past cancellation.
    pub async fn acquire(
        &self,
        exclude: &[usize],
        cooldown: Duration,
        cancel: &CancellationToken,
    ) -> Result<SlotLease<'_>> {
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if let Some(lease) = self.try_acquire(exclude, cooldown) {
                return Ok(lease);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }

    fn release(&self, index: usize) {
        let mut state = self.lock();
        if let Some(b) = state.busy.get_mut(index) {
            *b = false;
        }
    }

    /// Keep a slot out of rotation for `duration` (or longer if already cooling).
    pub fn cool_down(&self, index: usize, duration: Duration) {
        self.cooldowns.set(index, duration);
    }

    pub fn suspend(&self, index: usize) {
        let mut state = self.lock();
        if let Some(s) = state.suspended.get_mut(index) {
            *s = true;
        }
    }

    pub fn resume(&self, index: usize) {
        let mut state = self.lock();
        if let Some(s) = state.suspended.get_mut(index) {
            *s = false;
        }
    }

    pub fn is_suspended(&self, index: usize) -> bool {
        self.lock().suspended.get(index).copied().unwrap_or(false)
    }

    pub fn busy_count(&self) -> usize {
        self.lock().busy.iter().filter(|b| **b).count()
    }

    pub fn suspended_count(&self) -> usize {
        self.lock().suspended.iter().filter(|s| **s).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn round_robin_then_exhausted() {
        let gate = SlotGate::new(2, Duration::from_millis(5));
        let a = gate.try_acquire(&[], Duration::ZERO).unwrap();
        let b = gate.try_acquire(&[], Duration::ZERO).unwrap();
        assert_ne!(a.index(), b.index());
        assert!(gate.try_acquire(&[], Duration::ZERO).is_none());
        assert_eq!(gate.busy_count(), 2);

        drop(a);
        assert_eq!(gate.busy_count(), 1);
        assert!(gate.try_acquire(&[], Duration::ZERO).is_some());
    }

    #[test]
    fn cooling_slot_is_skipped_after_release() {
        let gate = SlotGate::new(1, Duration::from_millis(5));
        let lease = gate.try_acquire(&[], Duration::from_millis(50)).unwrap();
        drop(lease);
        assert!(gate.try_acquire(&[], Duration::ZERO).is_none(), "slot still cooling");

        std::thread::sleep(Duration::from_millis(70));
        assert!(gate.try_acquire(&[], Duration::ZERO).is_some());
    }

    #[test]
    fn exclusion_prefers_untried_slots_but_falls_back() {
        let gate = SlotGate::new(2, Duration::from_millis(5));
        let lease = gate.try_acquire(&[0], Duration::ZERO).unwrap();
        assert_eq!(lease.index(), 1);
        drop(lease);

        let lease = gate.try_acquire(&[0, 1], Duration::ZERO).unwrap();
        assert!(lease.index() < 2);
    }

    #[test]
    fn suspended_slot_is_not_handed_out() {
        let gate = SlotGate::new(1, Duration::from_millis(5));
        gate.suspend(0);
        assert!(gate.try_acquire(&[], Duration::ZERO).is_none());
        gate.resume(0);
        assert!(gate.try_acquire(&[], Duration::ZERO).is_some());
    }

    #[tokio::test]
    async fn acquire_observes_cancellation() {
        let gate = SlotGate::new(1, Duration::from_millis(5));
        let _held = gate.try_acquire(&[], Duration::ZERO).unwrap();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = gate.acquire(&[], Duration::ZERO, &cancel).await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn concurrent_acquires_never_share_a_slot() {
        const SLOTS: usize = 3;
        let gate = Arc::new(SlotGate::new(SLOTS, Duration::from_millis(2)));
        let held: Arc<Vec<AtomicBool>> = Arc::new((0..SLOTS).map(|_| AtomicBool::new(false)).collect());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let held = Arc::clone(&held);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let lease = gate.acquire(&[], Duration::ZERO, &cancel).await.unwrap();
                    let was_held = held[lease.index()].swap(true, Ordering::SeqCst);
                    assert!(!was_held, "slot {} handed out twice", lease.index());
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);

                    tokio::time::sleep(Duration::from_millis(10)).await;

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    held[lease.index()].store(false, Ordering::SeqCst);
                    drop(lease);
                })
            })
            .collect();

        for t in tasks {
            t.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= SLOTS);
        assert_eq!(gate.busy_count(), 0);
    }
}
