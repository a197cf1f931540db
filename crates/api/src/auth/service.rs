//! Login, registration and logout orchestration

use std::collections::HashSet;
use std::sync::Arc;

use time::OffsetDateTime;
use walletguard_shared::{NewUser, PublicUser, Role, StoreError, UserRecord, UserStore};

use super::password;
use super::sessions::{log_prefix, Session, SessionError, SessionStore};

const MIN_USERNAME_LENGTH: usize = 3;
const MAX_USERNAME_LENGTH: usize = 32;
const MAX_EMAIL_LENGTH: usize = 254;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Username is already taken")]
    UsernameTaken,
    /// Same error for unknown usernames and wrong passwords
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Session refers to a user that no longer exists")]
    UserVanished,
    #[error("{0}")]
    Validation(String),
    #[error("User store error: {0}")]
    Store(#[from] StoreError),
    #[error("Session store error: {0}")]
    Session(#[from] SessionError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            AuthError::UsernameTaken => "username_taken",
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::NotAuthenticated => "not_authenticated",
            AuthError::UserVanished => "user_vanished",
            AuthError::Validation(_) => "validation_failed",
            AuthError::Store(_) | AuthError::Session(_) | AuthError::Internal(_) => {
                "internal_error"
            }
        }
    }
}

/// Result of a successful login or registration
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub user: PublicUser,
    pub session: Session,
}

async fn hash_blocking(plaintext: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || password::hash_password(&plaintext))
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
        .map_err(|e| AuthError::Internal(e.to_string()))
}

async fn verify_blocking(plaintext: String, hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || password::verify_password(&plaintext, &hash))
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))
}

fn validate_username(username: &str) -> Result<(), AuthError> {
    let length = username.chars().count();
    if !(MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&length) {
        return Err(AuthError::Validation(format!(
            "Username must be between {MIN_USERNAME_LENGTH} and {MAX_USERNAME_LENGTH} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(AuthError::Validation(
            "Username may only contain letters, digits, '_', '-' and '.'".to_string(),
        ));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    let valid = email.len() <= MAX_EMAIL_LENGTH
        && matches!(email.split_once('@'), Some((local, domain)) if !local.is_empty() && !domain.is_empty());
    if !valid {
        return Err(AuthError::Validation("Invalid email address".to_string()));
    }
    Ok(())
}

#[derive(Clone)]
pub struct AuthenticationService {
    users: Arc<dyn UserStore>,
    sessions: SessionStore,
    admin_usernames: Arc<HashSet<String>>,
}

impl AuthenticationService {
    pub fn new(users: Arc<dyn UserStore>, sessions: SessionStore) -> Self {
        Self {
            users,
            sessions,
            admin_usernames: Arc::new(HashSet::new()),
        }
    }

    /// Usernames that receive the admin role when they register
    pub fn with_admin_usernames(mut self, usernames: impl IntoIterator<Item = String>) -> Self {
        self.admin_usernames = Arc::new(usernames.into_iter().collect());
        self
    }

    pub async fn register(
        &self,
        username: &str,
        plaintext: &str,
        email: &str,
    ) -> Result<AuthOutcome, AuthError> {
        let username = username.trim();
        let email = email.trim();
        validate_username(username)?;
        validate_email(email)?;
        password::validate_password_strength(plaintext).map_err(AuthError::Validation)?;

        // cheap pre-check so a taken name does not pay for hashing
        if self.users.find_by_username(username).await?.is_some() {
            return Err(AuthError::UsernameTaken);
        }

        let password_hash = hash_blocking(plaintext.to_string()).await?;
        let role = if self.admin_usernames.contains(username) {
            Role::Admin
        } else {
            Role::User
        };

        let record = match self
            .users
            .create(NewUser {
                username: username.to_string(),
                password_hash,
                email: email.to_string(),
                role,
            })
            .await
        {
            Ok(record) => record,
            Err(StoreError::Conflict) => return Err(AuthError::UsernameTaken),
            Err(e) => return Err(e.into()),
        };

        let session = self.sessions.create(record.id, record.is_admin()).await?;
        tracing::info!(user_id = %record.id, username = %record.username, role = %record.role, "User registered");

        Ok(AuthOutcome {
            user: record.to_public(),
            session,
        })
    }

    pub async fn login(&self, username: &str, plaintext: &str) -> Result<AuthOutcome, AuthError> {
        let Some(mut record) = self.users.find_by_username(username.trim()).await? else {
            // equalize timing with the wrong-password path
            let _ = verify_blocking(plaintext.to_string(), password::dummy_hash().to_string()).await?;
            tracing::warn!("Login failed: unknown username");
            return Err(AuthError::InvalidCredentials);
        };

        if !verify_blocking(plaintext.to_string(), record.password_hash.clone()).await? {
            tracing::warn!(user_id = %record.id, "Login failed: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        record.last_login_at = Some(OffsetDateTime::now_utc());
        self.users.update(&record).await?;

        let session = self.sessions.create(record.id, record.is_admin()).await?;
        tracing::info!(user_id = %record.id, "User logged in");

        Ok(AuthOutcome {
            user: record.to_public(),
            session,
        })
    }

    /// Destroy the session. Always succeeds for unknown ids.
    pub async fn logout(&self, session_id: &str) -> Result<(), AuthError> {
        self.sessions.destroy(session_id).await?;
        tracing::info!(session = log_prefix(session_id), "User logged out");
        Ok(())
    }

    pub async fn current_user(&self, session_id: &str) -> Result<PublicUser, AuthError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(AuthError::NotAuthenticated)?;

        Ok(self.session_user(&session).await?.to_public())
    }

    /// Change the password and revoke every other session of the user
    pub async fn change_password(
        &self,
        session: &Session,
        current: &str,
        new: &str,
    ) -> Result<(), AuthError> {
        let mut record = self.session_user(session).await?;

        if !verify_blocking(current.to_string(), record.password_hash.clone()).await? {
            tracing::warn!(user_id = %record.id, "Password change rejected: wrong current password");
            return Err(AuthError::InvalidCredentials);
        }
        password::validate_password_strength(new).map_err(AuthError::Validation)?;

        record.password_hash = hash_blocking(new.to_string()).await?;
        self.users.update(&record).await?;

        let revoked = self
            .sessions
            .destroy_user_sessions(record.id, Some(&session.session_id))
            .await?;
        tracing::info!(user_id = %record.id, revoked, "Password changed");
        Ok(())
    }

    pub async fn update_profile(
        &self,
        session: &Session,
        email: &str,
    ) -> Result<PublicUser, AuthError> {
        let email = email.trim();
        validate_email(email)?;

        let mut record = self.session_user(session).await?;
        record.email = email.to_string();
        match self.users.update(&record).await {
            Ok(()) => Ok(record.to_public()),
            Err(StoreError::NotFound) => Err(AuthError::UserVanished),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the user a session belongs to; a dangling session is destroyed
    async fn session_user(&self, session: &Session) -> Result<UserRecord, AuthError> {
        match self.users.find_by_id(session.user_id).await? {
            Some(record) => Ok(record),
            None => {
                tracing::error!(
                    session = log_prefix(&session.session_id),
                    user_id = %session.user_id,
                    "Session references a user that no longer exists"
                );
                self.sessions.destroy(&session.session_id).await?;
                Err(AuthError::UserVanished)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walletguard_shared::InMemoryUserStore;

    fn service() -> (AuthenticationService, Arc<InMemoryUserStore>, SessionStore) {
        let users = Arc::new(InMemoryUserStore::new());
        let sessions = SessionStore::in_memory(None);
        let service = AuthenticationService::new(users.clone(), sessions.clone());
        (service, users, sessions)
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let (service, users, sessions) = service();
        let registered = service
            .register("alice", "Secr3tPW!", "alice@example.com")
            .await
            .unwrap();
        assert_eq!(registered.user.username, "alice");
        assert_eq!(registered.user.role, Role::User);
        assert!(sessions
            .get(&registered.session.session_id)
            .await
            .unwrap()
            .is_some());

        let logged_in = service.login("alice", "Secr3tPW!").await.unwrap();
        assert_eq!(logged_in.user.id, registered.user.id);
        assert_ne!(logged_in.session.session_id, registered.session.session_id);
        assert!(logged_in.user.last_login_at.is_some());

        let stored = users.find_by_username("alice").await.unwrap().unwrap();
        assert!(stored.last_login_at.is_some());
        assert_ne!(stored.password_hash, "Secr3tPW!");
    }

    #[tokio::test]
    async fn test_wrong_password_indistinguishable_from_unknown_user() {
        let (service, _, _) = service();
        service
            .register("alice", "Secr3tPW!", "alice@example.com")
            .await
            .unwrap();

        let wrong_password = service.login("alice", "Wr0ngPW!").await.unwrap_err();
        let unknown_user = service.login("mallory", "Secr3tPW!").await.unwrap_err();

        assert!(matches!(wrong_password, AuthError::InvalidCredentials));
        assert!(matches!(unknown_user, AuthError::InvalidCredentials));
        assert_eq!(wrong_password.to_string(), unknown_user.to_string());
        assert_eq!(wrong_password.reason_code(), unknown_user.reason_code());
    }

    #[tokio::test]
    async fn test_duplicate_username() {
        let (service, _, _) = service();
        service
            .register("alice", "Secr3tPW!", "alice@example.com")
            .await
            .unwrap();

        let err = service
            .register("alice", "An0therPW!", "other@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UsernameTaken));
    }

    #[tokio::test]
    async fn test_registration_validation() {
        let (service, _, _) = service();
        for (username, pw, email) in [
            ("al", "Secr3tPW!", "a@example.com"),
            ("alice smith", "Secr3tPW!", "a@example.com"),
            ("alice", "weak", "a@example.com"),
            ("alice", "Secr3tPW!", "not-an-email"),
            ("alice", "Secr3tPW!", "@example.com"),
        ] {
            let err = service.register(username, pw, email).await.unwrap_err();
            assert!(matches!(err, AuthError::Validation(_)), "{username} {email}");
        }
    }

    #[tokio::test]
    async fn test_admin_usernames_get_admin_role() {
        let (service, _, sessions) = service();
        let service = service.with_admin_usernames(["root-ops".to_string()]);

        let outcome = service
            .register("root-ops", "Secr3tPW!", "ops@example.com")
            .await
            .unwrap();
        assert_eq!(outcome.user.role, Role::Admin);
        let session = sessions
            .get(&outcome.session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_admin);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent_and_ends_session() {
        let (service, _, _) = service();
        let outcome = service
            .register("alice", "Secr3tPW!", "alice@example.com")
            .await
            .unwrap();
        let session_id = outcome.session.session_id;

        assert_eq!(service.current_user(&session_id).await.unwrap().username, "alice");

        service.logout(&session_id).await.unwrap();
        service.logout(&session_id).await.unwrap();
        service.logout("never-existed").await.unwrap();

        let err = service.current_user(&session_id).await.unwrap_err();
        assert!(matches!(err, AuthError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_current_user_for_deleted_user() {
        let (service, users, sessions) = service();
        let outcome = service
            .register("alice", "Secr3tPW!", "alice@example.com")
            .await
            .unwrap();
        users.delete(outcome.user.id).await.unwrap();

        let err = service
            .current_user(&outcome.session.session_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UserVanished));
        assert!(sessions
            .get(&outcome.session.session_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_change_password_revokes_other_sessions() {
        let (service, _, sessions) = service();
        let first = service
            .register("alice", "Secr3tPW!", "alice@example.com")
            .await
            .unwrap();
        let second = service.login("alice", "Secr3tPW!").await.unwrap();

        let err = service
            .change_password(&first.session, "Wr0ngPW!", "N3wSecretPW")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));

        service
            .change_password(&first.session, "Secr3tPW!", "N3wSecretPW")
            .await
            .unwrap();

        assert!(sessions.get(&first.session.session_id).await.unwrap().is_some());
        assert!(sessions.get(&second.session.session_id).await.unwrap().is_none());
        assert!(service.login("alice", "Secr3tPW!").await.is_err());
        assert!(service.login("alice", "N3wSecretPW").await.is_ok());
    }

    #[tokio::test]
    async fn test_update_profile() {
        let (service, _, _) = service();
        let outcome = service
            .register("alice", "Secr3tPW!", "alice@example.com")
            .await
            .unwrap();

        let updated = service
            .update_profile(&outcome.session, "alice@wallet.test")
            .await
            .unwrap();
        assert_eq!(updated.email, "alice@wallet.test");

        let err = service
            .update_profile(&outcome.session, "broken")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }
}
