use pointledger_shared::domain::{AchievementRule, Child, Level, LevelTier};
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub children: Vec<Child>,
    /// Threshold catalog seeded into the DB at startup. Data, not code:
    /// operators retune thresholds here (or via the catalog API) without a
    /// redeploy.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// IANA timezone used to turn timestamps into streak calendar days.
    pub timezone: Option<String>,
    pub dev_cors_origin: Option<String>,
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_levels")]
    pub levels: Vec<LevelTier>,
    #[serde(default = "default_rules")]
    pub rules: Vec<AchievementRule>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            levels: default_levels(),
            rules: default_rules(),
        }
    }
}

fn default_levels() -> Vec<LevelTier> {
    vec![
        LevelTier {
            level: Level::Bronze,
            min_total: 0,
        },
        LevelTier {
            level: Level::Silver,
            min_total: 200,
        },
        LevelTier {
            level: Level::Gold,
            min_total: 500,
        },
    ]
}

fn rule(
    key: &str,
    predicate: &str,
    threshold: Option<i64>,
    title: &str,
    description: &str,
    icon: &str,
) -> AchievementRule {
    AchievementRule {
        key: key.into(),
        predicate: predicate.into(),
        threshold,
        title: title.into(),
        description: description.into(),
        icon: icon.into(),
    }
}

fn default_rules() -> Vec<AchievementRule> {
    let mut rules = vec![rule(
        "first-points",
        "first_award",
        None,
        "First Points!",
        "Earned points for the very first time",
        "star",
    )];
    for t in [10, 50, 100, 200, 500, 1000, 2500] {
        rules.push(rule(
            &format!("points-{t}"),
            "total_at_least",
            Some(t),
            &format!("{t} Points"),
            &format!("Earned {t} points in total"),
            "trophy",
        ));
    }
    for t in [50, 100] {
        rules.push(rule(
            &format!("big-task-{t}"),
            "single_award_at_least",
            Some(t),
            &format!("Big Task {t}"),
            &format!("Earned {t} points with a single task"),
            "muscle",
        ));
    }
    for t in [3, 7, 30] {
        rules.push(rule(
            &format!("streak-{t}"),
            "streak_at_least",
            Some(t),
            &format!("{t}-Day Streak"),
            &format!("Earned points {t} days in a row"),
            "fire",
        ));
    }
    rules.push(rule(
        "first-spend",
        "first_redemption",
        None,
        "First Treat",
        "Spent points for the first time",
        "gift",
    ));
    rules.push(rule(
        "big-spend-100",
        "single_redemption_at_least",
        Some(100),
        "Big Spender",
        "Spent 100 points at once",
        "money",
    ));
    for t in [10, 50, 100] {
        rules.push(rule(
            &format!("activity-{t}"),
            "transaction_count_at_least",
            Some(t),
            &format!("{t} Events"),
            &format!("Recorded {t} point events"),
            "chart",
        ));
    }
    rules
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Timezone(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Yaml(e) => write!(f, "YAML error: {}", e),
            ConfigError::Timezone(tz) => write!(f, "unknown timezone: {}", tz),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        ConfigError::Yaml(value)
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        Self::load_from_path(path)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(&path)?;
        let cfg: AppConfig = serde_yaml::from_str(&text)?;
        cfg.timezone()?;
        Ok(cfg)
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz, ConfigError> {
        match &self.timezone {
            None => Ok(chrono_tz::UTC),
            Some(name) => name
                .parse::<chrono_tz::Tz>()
                .map_err(|_| ConfigError::Timezone(name.clone())),
        }
    }
}
