//! Resource, classpath and membership cache.
//!
//! Resources and classpaths are stored in flat vectors; every cross reference
//! is an index or an id resolved through this cache.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};

use super::store::ResourceRows;
use super::{CacheCell, CacheKind, Refresh, RefreshKind, RuleStore};
use crate::db::{Classpath, Resource, TableStat};

#[derive(Debug, Default)]
pub struct ResourceIndex {
    resources: Vec<Resource>,
    by_ident: HashMap<String, usize>,
    classpaths: Vec<Classpath>,
    classpath_by_id: HashMap<i64, usize>,
    classpath_by_path: HashMap<String, usize>,
    /// classpath id -> ancestor ids, root first
    prefixes: HashMap<i64, Vec<i64>>,
    /// classpath id -> member idents
    members: HashMap<i64, HashSet<String>>,
    /// ident -> paths of the classpaths it belongs to
    ident_classpaths: HashMap<String, BTreeSet<String>>,
}

impl ResourceIndex {
    pub fn build(rows: ResourceRows) -> Self {
        let mut index = ResourceIndex::default();

        for row in rows.resources {
            let ident = row.ident.clone();
            match Resource::try_from(row) {
                Ok(resource) => {
                    index.by_ident.insert(ident, index.resources.len());
                    index.resources.push(resource);
                }
                Err(e) => {
                    tracing::warn!(ident = %ident, error = %e, "Skipping resource with malformed tags");
                }
            }
        }

        index.classpaths = rows.classpaths;
        for (i, cp) in index.classpaths.iter().enumerate() {
            index.classpath_by_id.insert(cp.id, i);
            index.classpath_by_path.insert(cp.normalized().to_string(), i);
        }
        for cp in &index.classpaths {
            let mut ancestors: Vec<&Classpath> = index
                .classpaths
                .iter()
                .filter(|other| other.is_ancestor_of(cp))
                .collect();
            ancestors.sort_by_key(|a| a.normalized().len());
            index
                .prefixes
                .insert(cp.id, ancestors.iter().map(|a| a.id).collect());
        }

        for member in rows.members {
            let Some(&i) = index.classpath_by_id.get(&member.classpath_id) else {
                continue;
            };
            let path = index.classpaths[i].path.clone();
            index
                .ident_classpaths
                .entry(member.res_ident.clone())
                .or_default()
                .insert(path);
            index
                .members
                .entry(member.classpath_id)
                .or_default()
                .insert(member.res_ident);
        }

        index
    }
}

#[derive(Debug, Default)]
pub struct ResourceCache {
    cell: CacheCell<ResourceIndex>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_all(&self, index: ResourceIndex, stat: TableStat, now: i64) {
        self.cell.set_all(index, stat, now);
    }

    /// The resource, including its tag map
    pub fn tags_of(&self, ident: &str) -> Option<Resource> {
        let snapshot = self.cell.load();
        snapshot
            .data
            .by_ident
            .get(ident)
            .map(|&i| snapshot.data.resources[i].clone())
    }

    /// Paths of the classpaths `ident` belongs to
    pub fn classpaths_of(&self, ident: &str) -> Vec<String> {
        self.cell
            .load()
            .data
            .ident_classpaths
            .get(ident)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ancestor classpath ids of `classpath_id`, root first
    pub fn prefixes_of(&self, classpath_id: i64) -> Vec<i64> {
        self.cell
            .load()
            .data
            .prefixes
            .get(&classpath_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Idents that are direct members of `classpath_id`
    pub fn members_of(&self, classpath_id: i64) -> Vec<String> {
        let mut idents: Vec<String> = self
            .cell
            .load()
            .data
            .members
            .get(&classpath_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        idents.sort();
        idents
    }

    /// Whether `ident` belongs to `classpath` or one of its descendants
    pub fn resource_in_classpath(&self, ident: &str, classpath: &str) -> bool {
        let snapshot = self.cell.load();
        let data = &snapshot.data;
        let Some(&target) = data
            .classpath_by_path
            .get(classpath.trim_matches(crate::db::CLASSPATH_SEPARATOR))
        else {
            return false;
        };
        let target_id = data.classpaths[target].id;

        data.members.iter().any(|(cp_id, idents)| {
            idents.contains(ident)
                && (*cp_id == target_id
                    || data
                        .prefixes
                        .get(cp_id)
                        .map(|ancestors| ancestors.contains(&target_id))
                        .unwrap_or(false))
        })
    }
}

#[async_trait]
impl Refresh for ResourceCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Resources
    }

    async fn refresh(
        &self,
        store: &dyn RuleStore,
        now: i64,
        ceiling_secs: i64,
    ) -> anyhow::Result<RefreshKind> {
        let stat = store.stat(CacheKind::Resources).await?;
        if !self.cell.needs_refresh(stat, now, ceiling_secs) {
            return Ok(RefreshKind::Skipped);
        }
        let index = ResourceIndex::build(store.load_resources().await?);
        self.set_all(index, stat, now);
        Ok(RefreshKind::Full)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::db::{ClasspathMember, ResourceRow};

    /// Resource rows: `(ident, tags JSON)`, classpaths `(id, path)`, members `(classpath id, ident)`
    pub fn rows(
        resources: &[(&str, &str)],
        classpaths: &[(i64, &str)],
        members: &[(i64, &str)],
    ) -> ResourceRows {
        ResourceRows {
            resources: resources
                .iter()
                .enumerate()
                .map(|(i, (ident, tags))| ResourceRow {
                    id: i as i64 + 1,
                    ident: ident.to_string(),
                    alias: String::new(),
                    tags: tags.to_string(),
                    note: String::new(),
                    update_at: 1,
                })
                .collect(),
            classpaths: classpaths
                .iter()
                .map(|(id, path)| Classpath {
                    id: *id,
                    path: path.to_string(),
                    note: String::new(),
                    update_at: 1,
                })
                .collect(),
            members: members
                .iter()
                .map(|(cp, ident)| ClasspathMember {
                    classpath_id: *cp,
                    res_ident: ident.to_string(),
                    update_at: 1,
                })
                .collect(),
        }
    }
}
