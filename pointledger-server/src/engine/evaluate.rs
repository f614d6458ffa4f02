use pointledger_shared::domain::TransactionKind;

use crate::engine::catalog::{Predicate, Rule};

/// Snapshot of a child's aggregates immediately after one transaction was
/// applied, plus the per-event facts the catalog predicates look at.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub total_earned: i64,
    pub current_streak: i32,
    pub tx_amount: i64,
    pub tx_kind: TransactionKind,
    pub tx_count: i64,
    pub award_count: i64,
    pub redemption_count: i64,
}

impl Predicate {
    /// Whether this predicate holds for the given context. Pure; whether
    /// the achievement was already unlocked is the unlock writer's problem.
    pub fn holds(&self, ctx: &EvalContext) -> bool {
        match *self {
            Predicate::FirstAward => ctx.tx_amount > 0 && ctx.award_count == 1,
            Predicate::TotalAtLeast(t) => ctx.total_earned >= t,
            Predicate::SingleAwardAtLeast(t) => ctx.tx_amount >= t,
            Predicate::StreakAtLeast(n) => ctx.current_streak >= n,
            Predicate::FirstRedemption => {
                ctx.tx_kind == TransactionKind::Redemption && ctx.redemption_count == 1
            }
            Predicate::SingleRedemptionAtLeast(t) => {
                ctx.tx_kind == TransactionKind::Redemption && -ctx.tx_amount >= t
            }
            Predicate::TransactionCountAtLeast(n) => ctx.tx_count >= n,
        }
    }
}

/// Every rule whose predicate is satisfied by `ctx`, in catalog order.
/// Rules are independent; no rule's outcome affects another's.
pub fn due_achievements<'a>(rules: &'a [Rule], ctx: &EvalContext) -> Vec<&'a Rule> {
    rules.iter().filter(|r| r.predicate.holds(ctx)).collect()
}
