use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Bounds the number of simultaneously active peer connections in one
/// direction.
///
/// A torrent context carries one instance for outbound connections and one
/// for inbound ones. The counter is shared by every connection task, so
/// both primitives are single atomic steps: concurrent reservations can
/// never jointly overshoot the budget.
#[derive(Debug)]
pub struct ConnectionAdmission {
    budget: usize,
    active: AtomicUsize,
}

impl ConnectionAdmission {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            active: AtomicUsize::new(0),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// The number of currently reserved slots.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reserves up to `n` slots and returns how many were actually
    /// reserved: possibly fewer than requested, never more than the
    /// remaining budget.
    pub fn reserve(&self, n: usize) -> usize {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            let granted = n.min(self.budget.saturating_sub(current));
            if granted == 0 {
                return 0;
            }
            match self.active.compare_exchange_weak(
                current,
                current + granted,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return granted,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases `n` previously reserved slots, clamped at zero.
    pub fn release(&self, n: usize) {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            match self.active.compare_exchange_weak(
                current,
                current.saturating_sub(n),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Reserves up to `n` slots and wraps each in a release-on-drop guard.
    ///
    /// This is how the gateway hands slots to connection tasks: the guard
    /// travels into the task and the slot is given back on every exit
    /// path, whether the attempt succeeded, failed its handshake or hit an
    /// IO error.
    pub fn reserve_slots(self: &Arc<Self>, n: usize) -> Vec<AdmissionSlot> {
        let granted = self.reserve(n);
        (0..granted)
            .map(|_| AdmissionSlot {
                admission: Arc::clone(self),
            })
            .collect()
    }
}

/// One reserved admission slot, released exactly once, on drop.
#[derive(Debug)]
pub struct AdmissionSlot {
    admission: Arc<ConnectionAdmission>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.admission.release(1);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn grants_at_most_the_remaining_budget() {
        let admission = ConnectionAdmission::new(5);
        assert_eq!(admission.reserve(3), 3);
        assert_eq!(admission.reserve(3), 2);
        assert_eq!(admission.reserve(3), 0);
        assert_eq!(admission.active(), 5);

        admission.release(2);
        assert_eq!(admission.active(), 3);
        assert_eq!(admission.reserve(1), 1);
    }

    #[test]
    fn release_clamps_at_zero() {
        let admission = ConnectionAdmission::new(2);
        admission.reserve(1);
        admission.release(10);
        assert_eq!(admission.active(), 0);
        // the clamp must not mint extra budget
        assert_eq!(admission.reserve(10), 2);
    }

    #[test]
    fn concurrent_reservations_never_overshoot() {
        const BUDGET: usize = 64;
        let admission = Arc::new(ConnectionAdmission::new(BUDGET));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = Arc::clone(&admission);
                thread::spawn(move || {
                    (0..100).map(|_| admission.reserve(3)).sum::<usize>()
                })
            })
            .collect();
        let granted: usize =
            handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(granted, BUDGET);
        assert_eq!(admission.active(), BUDGET);
    }

    #[test]
    fn slots_release_on_drop() {
        let admission = Arc::new(ConnectionAdmission::new(3));
        let slots = admission.reserve_slots(5);
        assert_eq!(slots.len(), 3);
        assert_eq!(admission.active(), 3);

        drop(slots);
        assert_eq!(admission.active(), 0);
    }
}
