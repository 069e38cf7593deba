//! Resource, classpath and membership rows.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use super::alert_rule::parse_json_or_default;

/// Separator between classpath segments, e.g. `prod/web`
pub const CLASSPATH_SEPARATOR: char = '/';

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceRow {
    pub id: i64,
    pub ident: String,
    pub alias: String,
    pub tags: String,
    pub note: String,
    pub update_at: i64,
}

impl ResourceRow {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<ResourceRow>, sqlx::Error> {
        sqlx::query_as("SELECT id, ident, alias, tags, note, update_at FROM resources ORDER BY id")
            .fetch_all(db)
            .await
    }
}

/// A monitored resource (typically a host)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub ident: String,
    pub alias: String,
    pub tags: BTreeMap<String, String>,
    pub note: String,
}

impl TryFrom<ResourceRow> for Resource {
    type Error = serde_json::Error;

    fn try_from(row: ResourceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            ident: row.ident,
            alias: row.alias,
            tags: parse_json_or_default(&row.tags)?,
            note: row.note,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Classpath {
    pub id: i64,
    pub path: String,
    pub note: String,
    pub update_at: i64,
}

impl Classpath {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<Classpath>, sqlx::Error> {
        sqlx::query_as("SELECT id, path, note, update_at FROM classpaths ORDER BY id")
            .fetch_all(db)
            .await
    }

    /// Normalized path without leading or trailing separators
    pub fn normalized(&self) -> &str {
        self.path.trim_matches(CLASSPATH_SEPARATOR)
    }

    /// Whether `self` is a strict ancestor of `other` at a segment boundary
    pub fn is_ancestor_of(&self, other: &Classpath) -> bool {
        let parent = self.normalized();
        let child = other.normalized();
        !parent.is_empty()
            && child.len() > parent.len()
            && child.starts_with(parent)
            && child[parent.len()..].starts_with(CLASSPATH_SEPARATOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClasspathMember {
    pub classpath_id: i64,
    pub res_ident: String,
    pub update_at: i64,
}

impl ClasspathMember {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<ClasspathMember>, sqlx::Error> {
        sqlx::query_as("SELECT classpath_id, res_ident, update_at FROM classpath_resources")
            .fetch_all(db)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(id: i64, path: &str) -> Classpath {
        Classpath {
            id,
            path: path.into(),
            note: String::new(),
            update_at: 0,
        }
    }

    #[test]
    fn test_ancestor_requires_segment_boundary() {
        assert!(cp(1, "prod").is_ancestor_of(&cp(2, "prod/web")));
        assert!(cp(1, "prod/").is_ancestor_of(&cp(2, "/prod/web/")));
        assert!(!cp(1, "prod").is_ancestor_of(&cp(2, "production/web")));
        assert!(!cp(1, "prod/web").is_ancestor_of(&cp(2, "prod/web")));
    }

    #[test]
    fn test_resource_tags_parse() {
        let resource = Resource::try_from(ResourceRow {
            id: 1,
            ident: "h1".into(),
            alias: String::new(),
            tags: r#"{"env":"prod"}"#.into(),
            note: String::new(),
            update_at: 1,
        })
        .unwrap();
        assert_eq!(resource.tags.get("env").map(String::as_str), Some("prod"));
    }
}
