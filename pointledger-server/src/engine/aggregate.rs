use chrono::NaiveDate;
use pointledger_shared::domain::{Level, LevelTier, TransactionKind};

use crate::engine::evaluate::EvalContext;

/// Consecutive-calendar-day streak of awards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreakState {
    pub current: i32,
    pub longest: i32,
    pub last_award_date: Option<NaiveDate>,
}

/// The minimal view of a transaction the aggregator needs: its signed
/// amount, its declared kind, and its calendar date in the family timezone.
#[derive(Debug, Clone, Copy)]
pub struct TxView {
    pub amount: i64,
    pub kind: TransactionKind,
    pub date: NaiveDate,
}

/// Running per-child aggregation state. The real-time path loads this from
/// the stored child/streak rows plus log counters; reconciliation starts
/// from `default()` and folds the whole log. Both go through [`step`],
/// which is what makes replay deterministic.
///
/// [`step`]: EngineState::step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineState {
    pub total_earned: i64,
    pub streak: StreakState,
    pub tx_count: i64,
    pub award_count: i64,
    pub redemption_count: i64,
}

impl EngineState {
    /// Apply one transaction and return the evaluation context for it.
    ///
    /// `total_earned` only ever grows: it sums positive amounts, so
    /// redemptions and negative adjustments never reduce it. The streak
    /// moves only on awards (positive amounts); a same-day repeat leaves it
    /// unchanged, the next calendar day extends it, and any gap resets it
    /// to 1.
    pub fn step(&mut self, tx: &TxView) -> EvalContext {
        self.tx_count += 1;
        if tx.kind == TransactionKind::Redemption {
            self.redemption_count += 1;
        }
        if tx.amount > 0 {
            self.total_earned += tx.amount;
            self.award_count += 1;
            self.apply_award_date(tx.date);
        }
        EvalContext {
            total_earned: self.total_earned,
            current_streak: self.streak.current,
            tx_amount: tx.amount,
            tx_kind: tx.kind,
            tx_count: self.tx_count,
            award_count: self.award_count,
            redemption_count: self.redemption_count,
        }
    }

    fn apply_award_date(&mut self, d: NaiveDate) {
        match self.streak.last_award_date {
            None => self.streak.current = 1,
            Some(prev) if d == prev => {}
            Some(prev) if prev.succ_opt() == Some(d) => self.streak.current += 1,
            Some(prev) if d > prev => self.streak.current = 1,
            // An earlier date can only show up via backfilled history read
            // out of order; it never extends or breaks the streak.
            Some(_) => return,
        }
        self.streak.longest = self.streak.longest.max(self.streak.current);
        self.streak.last_award_date = Some(d);
    }

    /// Fold a full ordered history into a final state.
    pub fn replay<I: IntoIterator<Item = TxView>>(txs: I) -> Self {
        let mut state = EngineState::default();
        for tx in txs {
            state.step(&tx);
        }
        state
    }
}

/// Highest tier whose boundary is at or below `total`. Falls back to
/// bronze when no tier matches (an empty or misconfigured catalog).
pub fn level_for(tiers: &[LevelTier], total: i64) -> Level {
    tiers
        .iter()
        .filter(|t| t.min_total <= total)
        .max_by_key(|t| t.min_total)
        .map(|t| t.level)
        .unwrap_or(Level::Bronze)
}
