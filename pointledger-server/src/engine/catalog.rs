use pointledger_shared::domain::AchievementRule;
use tracing::warn;

/// Typed form of a catalog predicate. Thresholds are catalog data; this
/// enum only fixes the predicate kinds the evaluator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    FirstAward,
    TotalAtLeast(i64),
    SingleAwardAtLeast(i64),
    StreakAtLeast(i32),
    FirstRedemption,
    SingleRedemptionAtLeast(i64),
    TransactionCountAtLeast(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown predicate kind: {0}")]
    UnknownPredicate(String),

    #[error("predicate {0} requires a threshold")]
    MissingThreshold(String),

    #[error("predicate {0} threshold must be positive, got {1}")]
    InvalidThreshold(String, i64),
}

impl Predicate {
    pub fn parse(kind: &str, threshold: Option<i64>) -> Result<Self, CatalogError> {
        let need = |t: Option<i64>| -> Result<i64, CatalogError> {
            let v = t.ok_or_else(|| CatalogError::MissingThreshold(kind.to_string()))?;
            if v <= 0 {
                return Err(CatalogError::InvalidThreshold(kind.to_string(), v));
            }
            Ok(v)
        };
        match kind {
            "first_award" => Ok(Predicate::FirstAward),
            "first_redemption" => Ok(Predicate::FirstRedemption),
            "total_at_least" => Ok(Predicate::TotalAtLeast(need(threshold)?)),
            "single_award_at_least" => Ok(Predicate::SingleAwardAtLeast(need(threshold)?)),
            "streak_at_least" => {
                let v = need(threshold)?;
                let days = i32::try_from(v)
                    .map_err(|_| CatalogError::InvalidThreshold(kind.to_string(), v))?;
                Ok(Predicate::StreakAtLeast(days))
            }
            "single_redemption_at_least" => {
                Ok(Predicate::SingleRedemptionAtLeast(need(threshold)?))
            }
            "transaction_count_at_least" => {
                Ok(Predicate::TransactionCountAtLeast(need(threshold)?))
            }
            other => Err(CatalogError::UnknownPredicate(other.to_string())),
        }
    }
}

/// One parsed achievement rule with its display metadata.
#[derive(Debug, Clone)]
pub struct Rule {
    pub key: String,
    pub predicate: Predicate,
    pub title: String,
    pub description: String,
    pub icon: String,
}

/// Parse raw catalog rows into typed rules. A malformed row is logged and
/// skipped so one bad entry never blocks evaluation of the rest.
pub fn parse_rules(rows: &[AchievementRule]) -> Vec<Rule> {
    rows.iter()
        .filter_map(|r| match Predicate::parse(&r.predicate, r.threshold) {
            Ok(predicate) => Some(Rule {
                key: r.key.clone(),
                predicate,
                title: r.title.clone(),
                description: r.description.clone(),
                icon: r.icon.clone(),
            }),
            Err(e) => {
                warn!(key = %r.key, error = %e, "skipping malformed catalog rule");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(key: &str, predicate: &str, threshold: Option<i64>) -> AchievementRule {
        AchievementRule {
            key: key.to_string(),
            predicate: predicate.to_string(),
            threshold,
            title: key.to_string(),
            description: String::new(),
            icon: "star".to_string(),
        }
    }

    #[test]
    fn parses_all_known_kinds() {
        let rows = vec![
            raw("first-points", "first_award", None),
            raw("points-100", "total_at_least", Some(100)),
            raw("big-task", "single_award_at_least", Some(50)),
            raw("week-streak", "streak_at_least", Some(7)),
            raw("first-spend", "first_redemption", None),
            raw("big-spend", "single_redemption_at_least", Some(100)),
            raw("busy-bee", "transaction_count_at_least", Some(10)),
        ];
        let rules = parse_rules(&rows);
        assert_eq!(rules.len(), rows.len());
        assert_eq!(rules[1].predicate, Predicate::TotalAtLeast(100));
        assert_eq!(rules[3].predicate, Predicate::StreakAtLeast(7));
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let rows = vec![
            raw("ok", "total_at_least", Some(10)),
            raw("bad-kind", "points_at_least", Some(10)),
            raw("no-threshold", "total_at_least", None),
            raw("negative", "streak_at_least", Some(-3)),
            raw("overflow", "streak_at_least", Some(i64::from(i32::MAX) + 1)),
            raw("also-ok", "first_award", None),
        ];
        let rules = parse_rules(&rows);
        let keys: Vec<&str> = rules.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["ok", "also-ok"]);
    }
}
