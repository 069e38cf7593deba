//! Users and user groups, used to resolve alert recipients.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub nickname: String,
    pub email: String,
    pub phone: String,
    pub update_at: i64,
}

impl User {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as("SELECT id, username, nickname, email, phone, update_at FROM users ORDER BY id")
            .fetch_all(db)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserGroup {
    pub id: i64,
    pub name: String,
    pub update_at: i64,
}

impl UserGroup {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<UserGroup>, sqlx::Error> {
        sqlx::query_as("SELECT id, name, update_at FROM user_groups ORDER BY id")
            .fetch_all(db)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserGroupMember {
    pub group_id: i64,
    pub user_id: i64,
    pub update_at: i64,
}

impl UserGroupMember {
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<UserGroupMember>, sqlx::Error> {
        sqlx::query_as("SELECT group_id, user_id, update_at FROM user_group_members")
            .fetch_all(db)
            .await
    }
}
