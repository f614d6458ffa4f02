use serde::{Deserialize, Serialize};

use crate::domain::{Level, TransactionKind};

// Children
#[derive(Debug, Serialize, Deserialize)]
pub struct ChildDto {
    pub id: String,
    pub family_id: String,
    pub display_name: String,
}

// Ingest
#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionReq {
    pub amount: i64,
    pub kind: TransactionKind,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResp {
    pub progress: ProgressDto,
    /// Achievement keys newly unlocked by this event, in insertion order.
    pub unlocked: Vec<String>,
}

// Read-back
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressDto {
    pub child_id: String,
    pub total_earned: i64,
    pub level: Level,
    pub current_streak: i32,
    pub longest_streak: i32,
    pub last_award_date: Option<String>, // YYYY-MM-DD in the family timezone
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AchievementDto {
    pub kind: String,
    pub title: String,
    pub description: String,
    pub icon: String,
    pub unlocked_at: String, // RFC3339 UTC
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionHistoryItemDto {
    pub id: i32,
    pub amount: i64,
    pub kind: TransactionKind,
    pub reason: Option<String>,
    pub time: String, // RFC3339 UTC
}

// Catalog
#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogDto {
    pub levels: Vec<crate::domain::LevelTier>,
    pub rules: Vec<crate::domain::AchievementRule>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LevelTierReq {
    pub min_total: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AchievementRuleReq {
    pub predicate: String,
    #[serde(default)]
    pub threshold: Option<i64>,
    pub title: String,
    pub description: String,
    pub icon: String,
}

// Reconciliation
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReconcileReq {
    #[serde(default)]
    pub child_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconcileResp {
    pub children_checked: usize,
    pub children_corrected: usize,
    pub achievements_added: usize,
}
