use crate::storage::schema::{
    achievement_rules, achievements, children, level_tiers, streaks, transactions,
};
use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = children)]
pub struct Child {
    pub id: String,
    pub family_id: String,
    pub display_name: String,
    pub total_earned: i64,
    pub level: String,
    pub last_applied_tx_id: Option<i32>,
}

#[derive(Insertable)]
#[diesel(table_name = children)]
pub struct NewChild<'a> {
    pub id: &'a str,
    pub family_id: &'a str,
    pub display_name: &'a str,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = streaks)]
#[diesel(primary_key(child_id))]
#[diesel(belongs_to(Child, foreign_key = child_id))]
pub struct Streak {
    pub child_id: String,
    pub current_streak: i32,
    pub longest_streak: i32,
    pub last_award_date: Option<NaiveDate>,
}

#[derive(Insertable)]
#[diesel(table_name = streaks)]
pub struct NewStreak<'a> {
    pub child_id: &'a str,
    pub current_streak: i32,
    pub longest_streak: i32,
    pub last_award_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = transactions)]
#[diesel(belongs_to(Child, foreign_key = child_id))]
pub struct Transaction {
    pub id: i32,
    pub child_id: String,
    pub family_id: String,
    pub amount: i64,
    pub kind: String,
    pub reason: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = transactions)]
pub struct NewTransaction<'a> {
    pub child_id: &'a str,
    pub family_id: &'a str,
    pub amount: i64,
    pub kind: &'a str,
    pub reason: Option<&'a str>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = achievements)]
#[diesel(belongs_to(Child, foreign_key = child_id))]
pub struct Achievement {
    pub id: i32,
    pub child_id: String,
    pub kind: String,
    pub title: String,
    pub description: String,
    pub icon: String,
    pub unlocked_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = achievements)]
pub struct NewAchievement<'a> {
    pub child_id: &'a str,
    pub kind: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub icon: &'a str,
    pub unlocked_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = level_tiers)]
#[diesel(primary_key(level))]
pub struct LevelTierRow {
    pub level: String,
    pub min_total: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = achievement_rules)]
#[diesel(primary_key(key))]
pub struct AchievementRuleRow {
    pub key: String,
    pub predicate: String,
    pub threshold: Option<i64>,
    pub title: String,
    pub description: String,
    pub icon: String,
}
