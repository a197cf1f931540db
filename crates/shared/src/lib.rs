// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! WalletGuard shared persistence
//!
//! User records and the `UserStore` collaborator consumed by the API crate,
//! with an in-memory backend and a PostgreSQL backend.

pub mod db;
pub mod error;
pub mod users;

pub use db::{create_pool, run_migrations};
pub use error::{StoreError, StoreResult};
pub use users::{InMemoryUserStore, NewUser, PgUserStore, PublicUser, Role, UserRecord, UserStore};
