//! Pool bookkeeping: reserve, active set, pending checkouts and capacity.
//!
//! `PoolState` performs no I/O. Each transition returns the backend work it
//! needs as [`PoolEffect`]s for the manager to carry out.
//!
//! Capacity always counts in-flight creations, so completions arriving in any
//! order can never push the pool past `max_builders`.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;

use super::config::PoolConfig;
use crate::builder::BuilderHandle;
use crate::status::PoolStatus;

/// Work the manager must perform after a state transition.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolEffect {
    /// Ask the backend for one new builder. Already counted as outstanding.
    Create,
    /// Tear down a builder that has left the active set.
    Destroy(BuilderHandle),
    /// Re-run the refill step after the retry delay.
    ScheduleRefill,
}

/// A queued checkout. The requester holds the receiving end; dropping it
/// cancels the checkout.
#[derive(Debug)]
pub struct PendingCheckout {
    reply: oneshot::Sender<BuilderHandle>,
    queued_at: Instant,
}

impl PendingCheckout {
    pub fn new(reply: oneshot::Sender<BuilderHandle>) -> Self {
        Self {
            reply,
            queued_at: Instant::now(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reply.is_closed()
    }
}

#[derive(Debug)]
pub struct PoolState {
    max_builders: usize,
    max_reserve_builders: usize,
    reserve: VecDeque<BuilderHandle>,
    active: Vec<BuilderHandle>,
    pending: VecDeque<PendingCheckout>,
    outstanding_creates: usize,
}

impl PoolState {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            max_builders: config.max_builders,
            max_reserve_builders: config.max_reserve_builders,
            reserve: VecDeque::with_capacity(config.max_reserve_builders),
            active: Vec::with_capacity(config.max_builders),
            pending: VecDeque::new(),
            outstanding_creates: 0,
        }
    }

    /// Queue a checkout and hand out builders if any are in reserve.
    pub fn checkout(&mut self, request: PendingCheckout) -> Vec<PoolEffect> {
        self.pending.push_back(request);
        let mut effects = Vec::new();
        self.dispatch(&mut effects);
        self.check_invariants();
        effects
    }

    /// Take a builder out of the active set for destruction.
    ///
    /// # Panics
    ///
    /// Panics if `builder` is not checked out. Returning an unknown or already
    /// returned builder would corrupt capacity accounting.
    pub fn return_builder(&mut self, builder: BuilderHandle) -> PoolEffect {
        let Some(index) = self.active.iter().position(|b| *b == builder) else {
            panic!(
                "builder {} returned to the pool but is not checked out",
                builder
            );
        };
        let builder = self.active.remove(index);
        tracing::info!(builder_id = %builder, active = self.active.len(), "Builder returned");
        self.check_invariants();
        PoolEffect::Destroy(builder)
    }

    /// A creation request succeeded: the builder joins the back of the reserve.
    pub fn create_succeeded(&mut self, builder: BuilderHandle) -> Vec<PoolEffect> {
        self.resolve_create();
        self.reserve.push_back(builder);
        let mut effects = Vec::new();
        self.dispatch(&mut effects);
        self.check_invariants();
        effects
    }

    /// A creation request failed: release its capacity and retry the refill
    /// step later, which recomputes how many builders are still needed.
    pub fn create_failed(&mut self) -> Vec<PoolEffect> {
        self.resolve_create();
        self.check_invariants();
        vec![PoolEffect::ScheduleRefill]
    }

    /// The backend confirmed a builder is gone, freeing capacity.
    pub fn destroy_succeeded(&mut self) -> Vec<PoolEffect> {
        self.refill()
    }

    /// Request enough builders to top up the reserve without exceeding capacity.
    pub fn refill(&mut self) -> Vec<PoolEffect> {
        let mut effects = Vec::new();
        self.refill_into(&mut effects);
        self.check_invariants();
        effects
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            active: self.active.clone(),
            reserve: self.reserve.iter().cloned().collect(),
            // Cancelled checkouts stay queued until dispatch reaches them.
            pending: self.pending.iter().filter(|p| !p.is_cancelled()).count(),
            outstanding_creates: self.outstanding_creates,
        }
    }

    pub fn reserve_len(&self) -> usize {
        self.reserve.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn outstanding_creates(&self) -> usize {
        self.outstanding_creates
    }

    fn resolve_create(&mut self) {
        assert!(
            self.outstanding_creates > 0,
            "creation resolved with no outstanding create requests"
        );
        self.outstanding_creates -= 1;
    }

    /// Pair the oldest pending checkout with the oldest reserve builder until
    /// one side runs out.
    fn dispatch(&mut self, effects: &mut Vec<PoolEffect>) {
        tracing::debug!(
            pending = self.pending.len(),
            reserve = self.reserve.len(),
            "Processing pending checkouts"
        );

        while !self.reserve.is_empty() {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            if request.is_cancelled() {
                tracing::debug!("Discarding checkout abandoned by its requester");
                continue;
            }
            let Some(builder) = self.reserve.pop_front() else {
                self.pending.push_front(request);
                break;
            };

            let waited_ms = request.queued_at.elapsed().as_millis() as u64;
            match request.reply.send(builder.clone()) {
                Ok(()) => {
                    tracing::info!(builder_id = %builder, waited_ms, "Providing builder to client");
                    self.active.push(builder);
                    self.refill_into(effects);
                }
                Err(builder) => {
                    // Receiver went away between the check and the send; the
                    // builder was never handed over.
                    tracing::debug!(builder_id = %builder, "Checkout abandoned during handoff");
                    self.reserve.push_front(builder);
                }
            }
        }
    }

    fn refill_into(&mut self, effects: &mut Vec<PoolEffect>) {
        let potential_reserve = self.reserve.len() + self.outstanding_creates;
        let potential_total = potential_reserve + self.active.len();

        let deficit = self.max_reserve_builders.saturating_sub(potential_reserve);
        let capacity_left = self.max_builders.saturating_sub(potential_total);
        let request_count = deficit.min(capacity_left);

        tracing::debug!(
            reserve = self.reserve.len(),
            outstanding = self.outstanding_creates,
            active = self.active.len(),
            request_count,
            "Checking reserve builder count"
        );

        if request_count > 0 {
            tracing::info!(request_count, "Requesting new builders");
        }
        for _ in 0..request_count {
            self.outstanding_creates += 1;
            effects.push(PoolEffect::Create);
        }
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.reserve.len() + self.outstanding_creates + self.active.len() <= self.max_builders,
            "capacity exceeded: reserve={} outstanding={} active={} max={}",
            self.reserve.len(),
            self.outstanding_creates,
            self.active.len(),
            self.max_builders
        );
        debug_assert!(
            self.reserve.is_empty() || self.pending.is_empty(),
            "reserve and pending checkouts both non-empty after dispatch"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max: usize, reserve: usize) -> PoolState {
        PoolState::new(
            &PoolConfig::new()
                .with_max_builders(max)
                .with_max_reserve_builders(reserve),
        )
    }

    fn builder(n: usize) -> BuilderHandle {
        BuilderHandle::new(format!("b{}", n), "10.0.0.1", 8080)
    }

    fn request() -> (PendingCheckout, oneshot::Receiver<BuilderHandle>) {
        let (tx, rx) = oneshot::channel();
        (PendingCheckout::new(tx), rx)
    }

    fn creates(effects: &[PoolEffect]) -> usize {
        effects.iter().filter(|e| **e == PoolEffect::Create).count()
    }

    fn assert_capacity(s: &PoolState, max: usize) {
        assert!(s.reserve_len() + s.outstanding_creates() + s.active_len() <= max);
    }

    #[test]
    fn initial_refill_requests_reserve_target() {
        let mut s = state(5, 3);
        let effects = s.refill();
        assert_eq!(creates(&effects), 3);
        assert_eq!(s.outstanding_creates(), 3);

        // Outstanding creates are counted, so a second refill issues nothing.
        assert!(s.refill().is_empty());
    }

    #[test]
    fn refill_converges_to_reserve_target() {
        let mut s = state(5, 3);
        let issued = creates(&s.refill());
        for n in 0..issued {
            let effects = s.create_succeeded(builder(n));
            assert!(effects.is_empty());
        }
        assert_eq!(s.reserve_len(), 3);
        assert_eq!(s.active_len(), 0);
        assert_eq!(s.outstanding_creates(), 0);
    }

    #[test]
    fn fifo_pairing_of_requests_and_builders() {
        let mut s = state(3, 2);
        assert_eq!(creates(&s.refill()), 2);

        let (r1, mut rx1) = request();
        let (r2, mut rx2) = request();
        let (r3, mut rx3) = request();
        assert!(s.checkout(r1).is_empty());
        assert!(s.checkout(r2).is_empty());
        assert!(s.checkout(r3).is_empty());

        let _ = s.create_succeeded(builder(1));
        let _ = s.create_succeeded(builder(2));

        assert_eq!(rx1.try_recv().unwrap(), builder(1));
        assert_eq!(rx2.try_recv().unwrap(), builder(2));
        assert!(rx3.try_recv().is_err());
        assert_eq!(s.pending_len(), 1);
        assert_eq!(s.active_len(), 2);
    }

    #[test]
    fn two_early_checkouts_with_capacity_two() {
        let mut s = state(2, 1);
        assert_eq!(creates(&s.refill()), 1);

        let (r1, mut rx1) = request();
        let (r2, mut rx2) = request();
        assert!(s.checkout(r1).is_empty());
        assert!(s.checkout(r2).is_empty());

        // First builder goes straight to r1, then refill asks for the one
        // builder capacity still allows.
        let effects = s.create_succeeded(builder(1));
        assert_eq!(creates(&effects), 1);
        assert_eq!(rx1.try_recv().unwrap(), builder(1));

        let effects = s.create_succeeded(builder(2));
        assert!(effects.is_empty(), "at capacity, got {:?}", effects);
        assert_eq!(rx2.try_recv().unwrap(), builder(2));

        assert_eq!(s.reserve_len(), 0);
        assert_eq!(s.active_len(), 2);
        assert_eq!(s.outstanding_creates(), 0);
    }

    #[test]
    fn checkout_served_immediately_from_reserve() {
        let mut s = state(2, 1);
        let _ = s.refill();
        let _ = s.create_succeeded(builder(1));

        let (r, mut rx) = request();
        let effects = s.checkout(r);
        assert_eq!(rx.try_recv().unwrap(), builder(1));
        // Checkout consumed reserve, refill tops it back up.
        assert_eq!(creates(&effects), 1);
    }

    #[test]
    fn return_then_destroy_frees_capacity() {
        let mut s = state(1, 1);
        let _ = s.refill();
        let (r, mut rx) = request();
        let _ = s.checkout(r);
        let _ = s.create_succeeded(builder(1));
        let b = rx.try_recv().unwrap();

        // At capacity while the builder is checked out.
        assert!(s.refill().is_empty());

        assert_eq!(s.return_builder(b.clone()), PoolEffect::Destroy(b));
        assert_eq!(s.active_len(), 0);

        let effects = s.destroy_succeeded();
        assert_eq!(creates(&effects), 1);
        assert_capacity(&s, 1);
    }

    #[test]
    #[should_panic(expected = "is not checked out")]
    fn returning_unknown_builder_panics() {
        let mut s = state(2, 1);
        let _ = s.return_builder(builder(9));
    }

    #[test]
    #[should_panic(expected = "is not checked out")]
    fn returning_reserve_builder_panics() {
        let mut s = state(2, 1);
        let _ = s.refill();
        let _ = s.create_succeeded(builder(1));
        let _ = s.return_builder(builder(1));
    }

    #[test]
    fn create_failure_schedules_refill_and_releases_capacity() {
        let mut s = state(2, 2);
        assert_eq!(creates(&s.refill()), 2);

        assert_eq!(s.create_failed(), vec![PoolEffect::ScheduleRefill]);
        assert_eq!(s.outstanding_creates(), 1);

        // The retried refill only asks for what is still missing.
        assert_eq!(creates(&s.refill()), 1);
        assert_eq!(s.outstanding_creates(), 2);
    }

    #[test]
    fn abandoned_checkout_does_not_consume_builder() {
        let mut s = state(2, 1);
        let _ = s.refill();

        let (r1, rx1) = request();
        let (r2, mut rx2) = request();
        let _ = s.checkout(r1);
        let _ = s.checkout(r2);
        drop(rx1);

        let _ = s.create_succeeded(builder(1));
        assert_eq!(rx2.try_recv().unwrap(), builder(1));
        assert_eq!(s.pending_len(), 0);
        assert_eq!(s.active_len(), 1);
    }

    #[test]
    fn abandoned_checkout_leaves_builder_in_reserve() {
        let mut s = state(2, 1);
        let _ = s.refill();
        let (r, rx) = request();
        let _ = s.checkout(r);
        drop(rx);

        let effects = s.create_succeeded(builder(1));
        assert!(effects.is_empty());
        assert_eq!(s.reserve_len(), 1);
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn capacity_holds_across_interleavings() {
        // Deterministic pseudo-random walk over checkouts, returns and backend
        // completions, checking the capacity invariant after every step.
        let (max, reserve) = (4, 2);
        let mut s = state(max, reserve);
        let mut outstanding = creates(&s.refill());
        let mut receivers = VecDeque::new();
        let mut held: Vec<BuilderHandle> = Vec::new();
        let mut destroying = 0usize;
        let mut next_id = 0usize;
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;

        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let effects = match seed % 5 {
                0 => {
                    let (r, rx) = request();
                    receivers.push_back(rx);
                    s.checkout(r)
                }
                1 if outstanding > 0 => {
                    outstanding -= 1;
                    next_id += 1;
                    s.create_succeeded(builder(next_id))
                }
                2 if outstanding > 0 => {
                    outstanding -= 1;
                    let _ = s.create_failed();
                    s.refill()
                }
                3 if !held.is_empty() => {
                    let b = held.swap_remove(0);
                    let PoolEffect::Destroy(_) = s.return_builder(b) else {
                        panic!("return must destroy");
                    };
                    destroying += 1;
                    Vec::new()
                }
                4 if destroying > 0 => {
                    destroying -= 1;
                    s.destroy_succeeded()
                }
                _ => Vec::new(),
            };
            outstanding += creates(&effects);

            while let Some(mut rx) = receivers.pop_front() {
                match rx.try_recv() {
                    Ok(b) => held.push(b),
                    Err(oneshot::error::TryRecvError::Empty) => {
                        receivers.push_front(rx);
                        break;
                    }
                    Err(oneshot::error::TryRecvError::Closed) => {}
                }
            }

            assert_eq!(s.outstanding_creates(), outstanding);
            assert_eq!(s.active_len(), held.len());
            assert_capacity(&s, max);
            assert!(s.reserve_len() + s.outstanding_creates() <= reserve);
            assert!(s.reserve_len() == 0 || s.pending_len() == 0);
        }
    }
}
