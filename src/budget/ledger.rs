//! Hierarchical token budget ledger.
//!
//! # Invariants
//! - `consumed + reserved_for_children <= total` for every allocation (enforced at all times)
//! - `reserved_for_children` equals the summed `total` of the allocation's open children
//! - `consumed` never decreases
//!
//! Every operation takes the ledger lock, so allocate/charge/settle/release are
//! atomic with respect to each other even when sibling nodes race.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Identifier of one allocation inside a [`BudgetLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(u64);

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "alloc-{}", self.0)
    }
}

/// Lifecycle of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    /// Owned by a live node; may be charged and lend to children.
    Open,
    /// Closed by its owner; unused units went back to the parent.
    Settled,
    /// Reclaimed on node destruction.
    Released,
}

/// A quota of work units owned by exactly one node.
///
/// Fields are private: all mutations go through the ledger so the invariants
/// hold between any two operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAllocation {
    id: AllocationId,
    parent: Option<AllocationId>,
    total: u64,
    consumed: u64,
    reserved_for_children: u64,
    state: AllocationState,
    children: Vec<AllocationId>,
}

impl BudgetAllocation {
    fn new(id: AllocationId, parent: Option<AllocationId>, total: u64) -> Self {
        Self {
            id,
            parent,
            total,
            consumed: 0,
            reserved_for_children: 0,
            state: AllocationState::Open,
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn parent(&self) -> Option<AllocationId> {
        self.parent
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn reserved_for_children(&self) -> u64 {
        self.reserved_for_children
    }

    pub fn state(&self) -> AllocationState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == AllocationState::Open
    }

    /// Units neither consumed nor lent out.
    ///
    /// # Property
    /// `available() == total - consumed - reserved_for_children`
    pub fn available(&self) -> u64 {
        self.total
            .saturating_sub(self.consumed.saturating_add(self.reserved_for_children))
    }

    /// Fraction of the ceiling still available, in [0, 1].
    pub fn available_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.available() as f64 / self.total as f64
    }
}

/// Errors related to budget operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    #[error("Insufficient budget: requested {requested} units, {available} available")]
    InsufficientBudget { requested: u64, available: u64 },

    #[error("Budget exhausted: charge of {requested} units exceeded the {available} remaining")]
    Exhausted { requested: u64, available: u64 },

    #[error("Child ceiling of {requested} units must be below the parent's total of {parent_total}")]
    CeilingTooLarge { requested: u64, parent_total: u64 },

    #[error("Allocation {0} is already closed")]
    AlreadyClosed(AllocationId),

    #[error("Allocation {id} still has {open} open child allocations")]
    OutstandingChildren { id: AllocationId, open: usize },

    #[error("Unknown allocation: {0}")]
    UnknownAllocation(AllocationId),

    #[error("Ledger invariant violated: {0}")]
    InvariantViolated(String),
}

#[derive(Debug, Default)]
struct LedgerState {
    next_id: u64,
    allocations: HashMap<AllocationId, BudgetAllocation>,
}

impl LedgerState {
    fn insert(&mut self, parent: Option<AllocationId>, total: u64) -> AllocationId {
        self.next_id += 1;
        let id = AllocationId(self.next_id);
        self.allocations
            .insert(id, BudgetAllocation::new(id, parent, total));
        id
    }

    fn get(&self, id: AllocationId) -> Result<&BudgetAllocation, BudgetError> {
        self.allocations
            .get(&id)
            .ok_or(BudgetError::UnknownAllocation(id))
    }

    fn get_mut(&mut self, id: AllocationId) -> Result<&mut BudgetAllocation, BudgetError> {
        self.allocations
            .get_mut(&id)
            .ok_or(BudgetError::UnknownAllocation(id))
    }

    fn open_children(&self, id: AllocationId) -> Vec<AllocationId> {
        self.allocations
            .get(&id)
            .map(|a| {
                a.children
                    .iter()
                    .copied()
                    .filter(|c| self.allocations.get(c).is_some_and(|c| c.is_open()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Close an open allocation and roll its usage into the parent.
    ///
    /// # Precondition
    /// The allocation is open and has no open children.
    fn close(&mut self, id: AllocationId, state: AllocationState) -> Result<u64, BudgetError> {
        let (parent, total, consumed) = {
            let alloc = self.get_mut(id)?;
            alloc.state = state;
            (alloc.parent, alloc.total, alloc.consumed)
        };

        if let Some(parent_id) = parent {
            let parent = self.get_mut(parent_id)?;
            parent.reserved_for_children = parent.reserved_for_children.saturating_sub(total);
            parent.consumed = parent.consumed.saturating_add(consumed);
        }

        Ok(total.saturating_sub(consumed))
    }

    /// Release `id` and all of its open descendants, children first.
    fn release_subtree(&mut self, id: AllocationId) -> Result<(), BudgetError> {
        for child in self.open_children(id) {
            self.release_subtree(child)?;
        }
        if self.get(id)?.is_open() {
            self.close(id, AllocationState::Released)?;
        }
        Ok(())
    }
}

/// The single serialization point for every allocation decision.
#[derive(Debug, Default)]
pub struct BudgetLedger {
    state: Mutex<LedgerState>,
    freed: Notify,
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a root allocation with the full-context ceiling.
    pub fn seed_root(&self, total: u64) -> AllocationId {
        let id = self.lock().insert(None, total);
        tracing::debug!(allocation = %id, total, "Seeded root budget");
        id
    }

    /// Lend `amount` units from `parent` to a new child allocation.
    ///
    /// # Postcondition
    /// On success `parent.reserved_for_children` grows by `amount`.
    ///
    /// # Errors
    /// - `CeilingTooLarge` if `amount` is not strictly below the parent's total
    /// - `InsufficientBudget` if the parent cannot cover `amount` right now
    pub fn allocate(&self, parent: AllocationId, amount: u64) -> Result<AllocationId, BudgetError> {
        let mut state = self.lock();
        let parent_alloc = state.get_mut(parent)?;

        if !parent_alloc.is_open() {
            return Err(BudgetError::AlreadyClosed(parent));
        }
        if amount >= parent_alloc.total {
            return Err(BudgetError::CeilingTooLarge {
                requested: amount,
                parent_total: parent_alloc.total,
            });
        }
        let available = parent_alloc.available();
        if amount > available {
            return Err(BudgetError::InsufficientBudget {
                requested: amount,
                available,
            });
        }

        parent_alloc.reserved_for_children += amount;
        let id = state.insert(Some(parent), amount);
        state.get_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Like [`allocate`](Self::allocate), but queue for up to `wait` while
    /// sibling settlements may free enough capacity.
    ///
    /// A request that could never fit (more than the parent's unconsumed
    /// total) is rejected without waiting.
    pub async fn allocate_within(
        &self,
        parent: AllocationId,
        amount: u64,
        wait: Duration,
    ) -> Result<AllocationId, BudgetError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before trying so a settlement between the
            // attempt and the await is not missed.
            let notified = self.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.allocate(parent, amount) {
                Err(BudgetError::InsufficientBudget {
                    requested,
                    available,
                }) => {
                    let reachable = {
                        let state = self.lock();
                        let p = state.get(parent)?;
                        p.total.saturating_sub(p.consumed)
                    };
                    if amount > reachable {
                        return Err(BudgetError::InsufficientBudget {
                            requested,
                            available,
                        });
                    }

                    tracing::debug!(
                        parent = %parent,
                        requested,
                        available,
                        "Allocation queued until sibling capacity frees"
                    );
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(BudgetError::InsufficientBudget {
                            requested,
                            available,
                        });
                    }
                }
                other => return other,
            }
        }
    }

    /// Debit reasoning cost against an allocation.
    ///
    /// Returns the units still available. An overdraft consumes whatever was
    /// left and returns `Exhausted`; the allocation is never driven negative.
    pub fn charge(&self, id: AllocationId, amount: u64) -> Result<u64, BudgetError> {
        let mut state = self.lock();
        let alloc = state.get_mut(id)?;
        if !alloc.is_open() {
            return Err(BudgetError::AlreadyClosed(id));
        }

        let available = alloc.available();
        if amount > available {
            alloc.consumed += available;
            return Err(BudgetError::Exhausted {
                requested: amount,
                available,
            });
        }

        alloc.consumed += amount;
        Ok(alloc.available())
    }

    /// Record `consumed` as the final debit, close the allocation and return
    /// the unused remainder to the parent.
    ///
    /// Settling twice is a programming error and fails with `AlreadyClosed`.
    pub fn settle(&self, id: AllocationId, consumed: u64) -> Result<u64, BudgetError> {
        let returned = {
            let mut state = self.lock();
            let open_children = state.open_children(id).len();
            let alloc = state.get_mut(id)?;
            if !alloc.is_open() {
                tracing::error!(allocation = %id, "Double settlement of budget allocation");
                return Err(BudgetError::AlreadyClosed(id));
            }
            if open_children > 0 {
                return Err(BudgetError::OutstandingChildren {
                    id,
                    open: open_children,
                });
            }

            let available = alloc.available();
            if consumed > available {
                tracing::warn!(
                    allocation = %id,
                    consumed,
                    available,
                    "Final debit exceeds remaining budget; capping"
                );
            }
            alloc.consumed += consumed.min(available);
            state.close(id, AllocationState::Settled)?
        };

        self.freed.notify_waiters();
        Ok(returned)
    }

    /// Reclaim everything outstanding under `id` on node destruction.
    ///
    /// Open descendants are released depth-first before `id` itself. Releasing
    /// an already closed allocation is a no-op.
    pub fn release(&self, id: AllocationId) -> Result<(), BudgetError> {
        self.lock().release_subtree(id)?;
        self.freed.notify_waiters();
        Ok(())
    }

    /// Clone the current state of an allocation.
    pub fn snapshot(&self, id: AllocationId) -> Option<BudgetAllocation> {
        self.lock().allocations.get(&id).cloned()
    }

    /// Verify the ledger-wide invariants.
    pub fn check_invariants(&self) -> Result<(), BudgetError> {
        let state = self.lock();
        for alloc in state.allocations.values().filter(|a| a.is_open()) {
            if alloc.consumed.saturating_add(alloc.reserved_for_children) > alloc.total {
                return Err(BudgetError::InvariantViolated(format!(
                    "{} consumed {} + reserved {} > total {}",
                    alloc.id, alloc.consumed, alloc.reserved_for_children, alloc.total
                )));
            }
            let lent: u64 = state
                .open_children(alloc.id)
                .iter()
                .filter_map(|c| state.allocations.get(c))
                .map(|c| c.total)
                .sum();
            if lent != alloc.reserved_for_children {
                return Err(BudgetError::InvariantViolated(format!(
                    "{} reserved {} but open children hold {}",
                    alloc.id, alloc.reserved_for_children, lent
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_allocation_invariants() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(100);

        let child = ledger.allocate(root, 40).unwrap();
        let root_snapshot = ledger.snapshot(root).unwrap();
        assert_eq!(root_snapshot.reserved_for_children(), 40);
        assert_eq!(root_snapshot.available(), 60);

        assert_eq!(ledger.charge(child, 30).unwrap(), 10);
        let returned = ledger.settle(child, 0).unwrap();
        assert_eq!(returned, 10);

        let root_snapshot = ledger.snapshot(root).unwrap();
        assert_eq!(root_snapshot.reserved_for_children(), 0);
        assert_eq!(root_snapshot.consumed(), 30);
        assert_eq!(root_snapshot.available(), 70);
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn test_over_allocation_is_rejected_not_overdrawn() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(250);
        ledger.allocate(root, 100).unwrap();
        ledger.allocate(root, 100).unwrap();

        let err = ledger.allocate(root, 100).unwrap_err();
        assert_eq!(
            err,
            BudgetError::InsufficientBudget {
                requested: 100,
                available: 50
            }
        );
        assert_eq!(ledger.snapshot(root).unwrap().reserved_for_children(), 200);
    }

    #[test]
    fn test_child_ceiling_must_be_strictly_smaller() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(100);
        assert!(matches!(
            ledger.allocate(root, 100),
            Err(BudgetError::CeilingTooLarge { .. })
        ));
    }

    #[test]
    fn test_double_settlement_fails_fast() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(100);
        let child = ledger.allocate(root, 10).unwrap();

        ledger.settle(child, 5).unwrap();
        assert_eq!(
            ledger.settle(child, 0),
            Err(BudgetError::AlreadyClosed(child))
        );
        // Consumption was rolled up exactly once.
        assert_eq!(ledger.snapshot(root).unwrap().consumed(), 5);
    }

    #[test]
    fn test_overdraft_charge_exhausts_without_going_negative() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(100);
        let child = ledger.allocate(root, 10).unwrap();

        let err = ledger.charge(child, 25).unwrap_err();
        assert_eq!(
            err,
            BudgetError::Exhausted {
                requested: 25,
                available: 10
            }
        );
        let snapshot = ledger.snapshot(child).unwrap();
        assert_eq!(snapshot.consumed(), 10);
        assert_eq!(snapshot.available(), 0);
    }

    #[test]
    fn test_settle_with_open_children_is_rejected() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(1000);
        let child = ledger.allocate(root, 500).unwrap();
        ledger.allocate(child, 100).unwrap();

        assert!(matches!(
            ledger.settle(child, 0),
            Err(BudgetError::OutstandingChildren { open: 1, .. })
        ));
    }

    #[test]
    fn test_release_reclaims_subtree_children_first() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(1000);
        let child = ledger.allocate(root, 500).unwrap();
        let grandchild = ledger.allocate(child, 200).unwrap();
        ledger.charge(grandchild, 50).unwrap();
        ledger.charge(child, 20).unwrap();

        ledger.release(child).unwrap();

        assert_eq!(
            ledger.snapshot(grandchild).unwrap().state(),
            AllocationState::Released
        );
        assert_eq!(
            ledger.snapshot(child).unwrap().state(),
            AllocationState::Released
        );
        let root_snapshot = ledger.snapshot(root).unwrap();
        assert_eq!(root_snapshot.reserved_for_children(), 0);
        assert_eq!(root_snapshot.consumed(), 70);
        ledger.check_invariants().unwrap();

        // Nothing outstanding any more.
        ledger.release(child).unwrap();
    }

    #[test]
    fn test_budget_conservation_over_mixed_operations() {
        let ledger = BudgetLedger::new();
        let root_total = 10_000;
        let root = ledger.seed_root(root_total);
        let mut open = vec![root];
        let mut seed: u64 = 0x2545_f491;

        for _ in 0..2_000 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let pick = open[(seed >> 33) as usize % open.len()];
            let amount = (seed >> 17) % 400;

            match (seed >> 7) % 4 {
                0 => {
                    if let Ok(id) = ledger.allocate(pick, amount) {
                        open.push(id);
                    }
                }
                1 => {
                    let _ = ledger.charge(pick, amount / 4);
                }
                2 if pick != root => {
                    if ledger.settle(pick, amount / 8).is_ok() {
                        open.retain(|id| *id != pick);
                    }
                }
                3 if pick != root => {
                    ledger.release(pick).unwrap();
                    open.retain(|id| ledger.snapshot(*id).is_some_and(|a| a.is_open()));
                }
                _ => {}
            }

            ledger.check_invariants().unwrap();
            let r = ledger.snapshot(root).unwrap();
            assert!(r.consumed() + r.reserved_for_children() <= root_total);
        }
    }

    #[tokio::test]
    async fn test_third_spawn_queues_until_sibling_settles() {
        let ledger = Arc::new(BudgetLedger::new());
        let root = ledger.seed_root(250);
        let first = ledger.allocate(root, 100).unwrap();
        let _second = ledger.allocate(root, 100).unwrap();

        let waiter = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                ledger
                    .allocate_within(root, 100, Duration::from_secs(30))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished(), "third spawn should be queued");

        // First sibling used 50 of its 100 and settles 50 unused.
        ledger.charge(first, 50).unwrap();
        ledger.settle(first, 0).unwrap();

        let third = waiter.await.unwrap().unwrap();
        assert_eq!(ledger.snapshot(third).unwrap().total(), 100);
        let r = ledger.snapshot(root).unwrap();
        assert_eq!(r.consumed() + r.reserved_for_children(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_spawn_gives_up_after_bounded_wait() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(250);
        ledger.allocate(root, 100).unwrap();
        ledger.allocate(root, 100).unwrap();

        let err = ledger
            .allocate_within(root, 100, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BudgetError::InsufficientBudget { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_request_is_rejected_immediately() {
        let ledger = BudgetLedger::new();
        let root = ledger.seed_root(250);
        ledger.charge(root, 100).unwrap();

        // Only 150 units could ever become free again.
        let err = ledger
            .allocate_within(root, 200, Duration::from_secs(3600))
            .await
            .unwrap_err();
        assert!(matches!(err, BudgetError::InsufficientBudget { .. }));
    }
}
