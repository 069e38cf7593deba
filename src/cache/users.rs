//! Users, groups and group membership for recipient resolution.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

use super::store::UserRows;
use super::{CacheCell, CacheKind, Refresh, RefreshKind, RuleStore};
use crate::db::{AlertRule, TableStat, User, UserGroup};

#[derive(Debug, Default)]
pub struct UserIndex {
    users: HashMap<i64, User>,
    groups: HashMap<i64, UserGroup>,
    /// group id -> member user ids
    members: HashMap<i64, Vec<i64>>,
}

impl UserIndex {
    pub fn build(rows: UserRows) -> Self {
        let mut members: HashMap<i64, Vec<i64>> = HashMap::new();
        for m in rows.members {
            members.entry(m.group_id).or_default().push(m.user_id);
        }
        Self {
            users: rows.users.into_iter().map(|u| (u.id, u)).collect(),
            groups: rows.groups.into_iter().map(|g| (g.id, g)).collect(),
            members,
        }
    }
}

#[derive(Debug, Default)]
pub struct UserCache {
    cell: CacheCell<UserIndex>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_all(&self, index: UserIndex, stat: TableStat, now: i64) {
        self.cell.set_all(index, stat, now);
    }

    pub fn get_user(&self, id: i64) -> Option<User> {
        self.cell.load().data.users.get(&id).cloned()
    }

    pub fn get_group(&self, id: i64) -> Option<UserGroup> {
        self.cell.load().data.groups.get(&id).cloned()
    }

    /// Usernames of the rule's notify groups plus its explicit recipients,
    /// sorted and without duplicates
    pub fn recipients_for(&self, rule: &AlertRule) -> Vec<String> {
        let snapshot = self.cell.load();
        let data = &snapshot.data;
        let mut names: BTreeSet<String> = BTreeSet::new();

        for gid in &rule.notify_groups {
            let Some(uids) = data.members.get(gid) else {
                tracing::debug!(rule_id = rule.id, group_id = gid, "Notify group has no members");
                continue;
            };
            names.extend(
                uids.iter()
                    .filter_map(|uid| data.users.get(uid))
                    .map(|u| u.username.clone()),
            );
        }
        names.extend(
            rule.notify_recipients
                .iter()
                .filter(|r| !r.trim().is_empty())
                .cloned(),
        );
        names.into_iter().collect()
    }
}

#[async_trait]
impl Refresh for UserCache {
    fn kind(&self) -> CacheKind {
        CacheKind::Users
    }

    async fn refresh(
        &self,
        store: &dyn RuleStore,
        now: i64,
        ceiling_secs: i64,
    ) -> anyhow::Result<RefreshKind> {
        let stat = store.stat(CacheKind::Users).await?;
        if !self.cell.needs_refresh(stat, now, ceiling_secs) {
            return Ok(RefreshKind::Skipped);
        }
        let index = UserIndex::build(store.load_users().await?);
        self.set_all(index, stat, now);
        Ok(RefreshKind::Full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_rule, UserGroupMember};

    fn user(id: i64, username: &str) -> User {
        User {
            id,
            username: username.to_string(),
            nickname: String::new(),
            email: String::new(),
            phone: String::new(),
            update_at: 1,
        }
    }

    #[test]
    fn test_recipients_resolution() {
        let cache = UserCache::new();
        let index = UserIndex::build(UserRows {
            users: vec![user(1, "alice"), user(2, "bob"), user(3, "carol")],
            groups: vec![UserGroup {
                id: 10,
                name: "ops".into(),
                update_at: 1,
            }],
            members: vec![
                UserGroupMember {
                    group_id: 10,
                    user_id: 1,
                    update_at: 1,
                },
                UserGroupMember {
                    group_id: 10,
                    user_id: 2,
                    update_at: 1,
                },
                UserGroupMember {
                    group_id: 10,
                    user_id: 99,
                    update_at: 1,
                },
            ],
        });
        cache.set_all(index, TableStat::default(), 1);

        let mut rule = test_rule(1, "up == 0", 10);
        rule.notify_groups = vec![10, 11];
        rule.notify_recipients = vec!["bob".into(), "dave".into(), " ".into()];

        assert_eq!(cache.recipients_for(&rule), vec!["alice", "bob", "dave"]);
        assert_eq!(cache.get_group(10).map(|g| g.name), Some("ops".to_string()));
        assert_eq!(cache.get_user(3).map(|u| u.username), Some("carol".to_string()));
    }
}
