//! User records and the `UserStore` collaborator
//!
//! The authentication core only ever reads and writes users through
//! [`UserStore`]; it never owns the records. Two backends are provided:
//! - [`InMemoryUserStore`] for development and tests
//! - [`PgUserStore`] for PostgreSQL deployments

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(StoreError::Corrupt(format!("unknown role '{other}'"))),
        }
    }
}

/// A persisted user, including the password hash
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub role: Role,
    pub last_login_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl UserRecord {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Projection safe to return to clients
    pub fn to_public(&self) -> PublicUser {
        PublicUser {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role,
            last_login_at: self.last_login_at,
            created_at: self.created_at,
        }
    }
}

/// User record with the password hash stripped
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Input for [`UserStore::create`]
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub role: Role,
}

/// Lookup/create/update access to user records
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>>;

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<UserRecord>>;

    /// Fails with [`StoreError::Conflict`] if the username is taken
    async fn create(&self, new_user: NewUser) -> StoreResult<UserRecord>;

    /// Overwrites the mutable fields of an existing record
    async fn update(&self, user: &UserRecord) -> StoreResult<()>;

    /// Returns true if a record was removed
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Default)]
struct InMemoryUsers {
    by_id: HashMap<Uuid, UserRecord>,
    id_by_username: HashMap<String, Uuid>,
}

/// Process-resident user store
#[derive(Default)]
pub struct InMemoryUserStore {
    inner: RwLock<InMemoryUsers>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(self.inner.read().await.by_id.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<UserRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .id_by_username
            .get(username)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn create(&self, new_user: NewUser) -> StoreResult<UserRecord> {
        let mut inner = self.inner.write().await;
        if inner.id_by_username.contains_key(&new_user.username) {
            return Err(StoreError::Conflict);
        }

        let record = UserRecord {
            id: Uuid::new_v4(),
            username: new_user.username,
            password_hash: new_user.password_hash,
            email: new_user.email,
            role: new_user.role,
            last_login_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        inner
            .id_by_username
            .insert(record.username.clone(), record.id);
        inner.by_id.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, user: &UserRecord) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let existing = inner.by_id.get_mut(&user.id).ok_or(StoreError::NotFound)?;
        // username is immutable once created
        existing.password_hash = user.password_hash.clone();
        existing.email = user.email.clone();
        existing.role = user.role;
        existing.last_login_at = user.last_login_at;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.by_id.remove(&id) {
            Some(record) => {
                inner.id_by_username.remove(&record.username);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// =============================================================================
// PostgreSQL backend
// =============================================================================

/// Database row type for the `users` table
#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    password_hash: String,
    email: String,
    role: String,
    last_login_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(UserRecord {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            email: row.email,
            role: row.role.parse()?,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
        })
    }
}

const USER_COLUMNS: &str = "id, username, password_hash, email, role, last_login_at, created_at";

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(UserRecord::try_from).transpose()
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<UserRecord>> {
        let row: Option<UserRow> =
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"))
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        row.map(UserRecord::try_from).transpose()
    }

    async fn create(&self, new_user: NewUser) -> StoreResult<UserRecord> {
        let result: Result<UserRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO users (id, username, password_hash, email, role, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&new_user.username)
        .bind(&new_user.password_hash)
        .bind(&new_user.email)
        .bind(new_user.role.as_str())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row.try_into(),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, user: &UserRecord) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2,
                email = $3,
                role = $4,
                last_login_at = $5
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(user.last_login_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let rows_affected = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(rows_affected > 0)
    }
}
