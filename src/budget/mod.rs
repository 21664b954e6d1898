//! Budget module - hierarchical token quota tracking.
//!
//! # Key Concepts
//! - Ledger: the one serialization point for allocate/charge/settle/release
//! - Allocation: a node's exclusively owned quota of work units
//! - Ceiling: fixed child quota computed at spawn time, never raised later

mod allocation;
mod ledger;

pub use allocation::{ceiling_cap, child_ceiling};
pub use ledger::{AllocationId, AllocationState, BudgetAllocation, BudgetError, BudgetLedger};
