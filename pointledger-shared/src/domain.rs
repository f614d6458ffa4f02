use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("unknown value: {0}")]
pub struct ParseEnumError(pub String);

/// Reward tier derived from the lifetime earned total.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Bronze,
    Silver,
    Gold,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Bronze => "bronze",
            Level::Silver => "silver",
            Level::Gold => "gold",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(Level::Bronze),
            "silver" => Ok(Level::Silver),
            "gold" => Ok(Level::Gold),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Award,
    Redemption,
    Adjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Award => "award",
            TransactionKind::Redemption => "redemption",
            TransactionKind::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = ParseEnumError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "award" => Ok(TransactionKind::Award),
            "redemption" => Ok(TransactionKind::Redemption),
            "adjustment" => Ok(TransactionKind::Adjustment),
            other => Err(ParseEnumError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Child {
    pub id: String,
    pub family_id: String,
    pub display_name: String,
}

/// One level boundary: the lowest lifetime total that grants `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelTier {
    pub level: Level,
    pub min_total: i64,
}

/// One achievement rule as stored in the threshold catalog. `predicate`
/// names the predicate kind; `threshold` is its numeric parameter where
/// the kind takes one. Parsing into a typed predicate happens in the
/// engine, so a misconfigured row can be skipped instead of rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AchievementRule {
    pub key: String,
    pub predicate: String,
    #[serde(default)]
    pub threshold: Option<i64>,
    pub title: String,
    pub description: String,
    pub icon: String,
}
