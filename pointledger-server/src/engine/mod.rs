//! Pure engine logic: aggregation, catalog parsing and achievement
//! evaluation. No I/O happens here; the storage layer feeds these
//! functions and persists their results.

pub mod aggregate;
pub mod catalog;
pub mod evaluate;

pub use aggregate::{EngineState, StreakState, TxView, level_for};
pub use catalog::{Predicate, Rule, parse_rules};
pub use evaluate::{EvalContext, due_achievements};
