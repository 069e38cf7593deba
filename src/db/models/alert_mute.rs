//! Mute rule models.
//!
//! A mute row targets one rule (`rule_key` = rule id) or every rule (`*`) and
//! holds a JSON array of filters. Regexes are compiled once when the mute cache
//! is rebuilt, never per event.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use super::alert_rule::parse_json_or_default;

/// Key under which mutes that apply to every rule are stored
pub const MUTE_ALL_RULES: &str = "*";

/// Raw `alert_mutes` row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertMuteRow {
    pub id: i64,
    pub rule_key: String,
    pub filters: String,
    pub cause: String,
    pub btime: i64,
    pub etime: i64,
    pub disabled: i64,
    pub update_at: i64,
}

impl AlertMuteRow {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<AlertMuteRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT id, rule_key, filters, cause, btime, etime, disabled, update_at
            FROM alert_mutes
            ORDER BY id
            "#,
        )
        .fetch_all(db)
        .await
    }
}

/// Filter as stored in the `filters` column
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MuteFilterSpec {
    pub classpath_prefix: String,
    pub ident_regex: String,
    pub tags: BTreeMap<String, String>,
}

/// A compiled mute filter: classpath prefix, ident regex, required tag equalities
#[derive(Debug, Clone)]
pub struct MuteFilter {
    pub mute_id: i64,
    pub classpath_prefix: String,
    /// `None` when the stored pattern was empty (matches every ident)
    pub ident_regex: Option<Regex>,
    pub tags: BTreeMap<String, String>,
    /// Active window in unix seconds, 0 = unbounded
    pub btime: i64,
    pub etime: i64,
}

impl MuteFilter {
    pub fn compile(
        mute_id: i64,
        spec: MuteFilterSpec,
        btime: i64,
        etime: i64,
    ) -> Result<Self, regex::Error> {
        let ident_regex = if spec.ident_regex.is_empty() {
            None
        } else {
            Some(Regex::new(&spec.ident_regex)?)
        };
        Ok(Self {
            mute_id,
            classpath_prefix: spec.classpath_prefix,
            ident_regex,
            tags: spec.tags,
            btime,
            etime,
        })
    }

    pub fn is_active(&self, now: i64) -> bool {
        (self.btime == 0 || now >= self.btime) && (self.etime == 0 || now <= self.etime)
    }

    pub fn ident_matches(&self, ident: &str) -> bool {
        self.ident_regex
            .as_ref()
            .map(|re| re.is_match(ident))
            .unwrap_or(true)
    }

    /// Every required tag is present with the same value
    pub fn tags_match(&self, tags: &BTreeMap<String, String>) -> bool {
        self.tags
            .iter()
            .all(|(k, v)| tags.get(k).map(|actual| actual == v).unwrap_or(false))
    }

    /// Some classpath of the resource starts with the filter's prefix
    pub fn classpath_matches<'a, I>(&self, classpaths: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        if self.classpath_prefix.is_empty() {
            return true;
        }
        classpaths
            .into_iter()
            .any(|path| path.starts_with(&self.classpath_prefix))
    }
}

/// A mute row with its filters compiled
#[derive(Debug, Clone)]
pub struct AlertMute {
    pub id: i64,
    pub rule_key: String,
    pub cause: String,
    pub filters: Vec<MuteFilter>,
    pub disabled: bool,
}

impl AlertMute {
    pub fn from_row(row: AlertMuteRow) -> anyhow::Result<Self> {
        let specs: Vec<MuteFilterSpec> = parse_json_or_default(&row.filters)?;
        let filters = specs
            .into_iter()
            .map(|spec| MuteFilter::compile(row.id, spec, row.btime, row.etime))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id: row.id,
            rule_key: row.rule_key,
            cause: row.cause,
            filters,
            disabled: row.disabled != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(prefix: &str, regex: &str, tags: &[(&str, &str)]) -> MuteFilter {
        MuteFilter::compile(
            1,
            MuteFilterSpec {
                classpath_prefix: prefix.into(),
                ident_regex: regex.into(),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            0,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_filter_parts() {
        let f = filter("prod/", "^h.*$", &[("env", "prod")]);
        assert!(f.ident_matches("h1"));
        assert!(!f.ident_matches("db1"));
        assert!(f.classpath_matches(["prod", "prod/web"]));
        assert!(!f.classpath_matches(["staging/web"]));

        let mut tags = BTreeMap::new();
        tags.insert("env".to_string(), "prod".to_string());
        tags.insert("app".to_string(), "web".to_string());
        assert!(f.tags_match(&tags));
        tags.insert("env".to_string(), "dev".to_string());
        assert!(!f.tags_match(&tags));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let f = filter("", "", &[]);
        assert!(f.ident_matches("anything"));
        assert!(f.classpath_matches(std::iter::empty()));
        assert!(f.tags_match(&BTreeMap::new()));
    }

    #[test]
    fn test_active_window() {
        let mut f = filter("", "", &[]);
        f.btime = 100;
        f.etime = 200;
        assert!(!f.is_active(99));
        assert!(f.is_active(150));
        assert!(!f.is_active(201));
    }

    #[test]
    fn test_bad_regex_rejects_row() {
        let row = AlertMuteRow {
            id: 4,
            rule_key: "*".into(),
            filters: r#"[{"ident_regex": "("}]"#.into(),
            cause: String::new(),
            btime: 0,
            etime: 0,
            disabled: 0,
            update_at: 1,
        };
        assert!(AlertMute::from_row(row).is_err());
    }
}
