//! Backing store for the caches.

use async_trait::async_trait;

use crate::db::{
    table_stat, AlertMuteRow, AlertRuleRow, Classpath, ClasspathMember, DatasourceRow, DbPool,
    ResourceRow, StoreError, TableStat, User, UserGroup, UserGroupMember,
};

/// Group of tables backing one cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Rules,
    Mutes,
    Resources,
    Users,
    Datasources,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Rules => "rules",
            CacheKind::Mutes => "mutes",
            CacheKind::Resources => "resources",
            CacheKind::Users => "users",
            CacheKind::Datasources => "datasources",
        }
    }

    pub fn tables(&self) -> &'static [&'static str] {
        match self {
            CacheKind::Rules => &["alert_rules"],
            CacheKind::Mutes => &["alert_mutes"],
            CacheKind::Resources => &["resources", "classpaths", "classpath_resources"],
            CacheKind::Users => &["users", "user_groups", "user_group_members"],
            CacheKind::Datasources => &["datasources"],
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceRows {
    pub resources: Vec<ResourceRow>,
    pub classpaths: Vec<Classpath>,
    pub members: Vec<ClasspathMember>,
}

#[derive(Debug, Clone, Default)]
pub struct UserRows {
    pub users: Vec<User>,
    pub groups: Vec<UserGroup>,
    pub members: Vec<UserGroupMember>,
}

/// Read side of the relational rule store
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Combined `max(update_at)` / `count(*)` of the tables behind `kind`
    async fn stat(&self, kind: CacheKind) -> Result<TableStat, StoreError>;

    async fn load_rules(&self) -> Result<Vec<AlertRuleRow>, StoreError>;

    async fn load_mutes(&self) -> Result<Vec<AlertMuteRow>, StoreError>;

    async fn load_resources(&self) -> Result<ResourceRows, StoreError>;

    async fn load_users(&self) -> Result<UserRows, StoreError>;

    async fn load_datasources(&self) -> Result<Vec<DatasourceRow>, StoreError>;
}

/// [`RuleStore`] over the sqlx pool
#[derive(Debug, Clone)]
pub struct SqliteRuleStore {
    db: DbPool,
}

impl SqliteRuleStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RuleStore for SqliteRuleStore {
    async fn stat(&self, kind: CacheKind) -> Result<TableStat, StoreError> {
        let mut stats = Vec::with_capacity(kind.tables().len());
        for table in kind.tables() {
            stats.push(table_stat(&self.db, table).await?);
        }
        Ok(TableStat::combine(&stats))
    }

    async fn load_rules(&self) -> Result<Vec<AlertRuleRow>, StoreError> {
        Ok(AlertRuleRow::list_all(&self.db).await?)
    }

    async fn load_mutes(&self) -> Result<Vec<AlertMuteRow>, StoreError> {
        Ok(AlertMuteRow::list_all(&self.db).await?)
    }

    async fn load_resources(&self) -> Result<ResourceRows, StoreError> {
        Ok(ResourceRows {
            resources: ResourceRow::list_all(&self.db).await?,
            classpaths: Classpath::list_all(&self.db).await?,
            members: ClasspathMember::list_all(&self.db).await?,
        })
    }

    async fn load_users(&self) -> Result<UserRows, StoreError> {
        Ok(UserRows {
            users: User::list_all(&self.db).await?,
            groups: UserGroup::list_all(&self.db).await?,
            members: UserGroupMember::list_all(&self.db).await?,
        })
    }

    async fn load_datasources(&self) -> Result<Vec<DatasourceRow>, StoreError> {
        Ok(DatasourceRow::list_all(&self.db).await?)
    }
}
