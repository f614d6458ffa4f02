//! Gamification state engine for a family allowance/rewards tracker.
//!
//! The append-only transaction log is the source of truth; everything else
//! (lifetime totals, level tiers, daily streaks, achievement unlocks) is a
//! projection computed by the engine and repairable at any time by the
//! reconciliation job.

pub mod engine;
pub mod server;
pub mod storage;
