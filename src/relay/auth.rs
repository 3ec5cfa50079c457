/**
 * ============================================================================
 * AUTH SESSION MODULE
 * ============================================================================
 *
 * PURPOSE: Hold, persist, and rotate the collector bearer token
 *
 * SESSION LIFECYCLE:
 * 1. login / sync_with_web_token obtains credentials from the auth plane
 * 2. Credentials are persisted to {data_dir}/session.json, then adopted
 * 3. Successful batch responses may rotate the token (persist, then swap)
 * 4. logout (or a 401/403 from the data plane) clears memory and disk
 *
 * Session changes are published on a watch channel; the batch trigger
 * stops as soon as it observes `false`.
 *
 * ============================================================================
 */

use crate::relay::client::Collector;
use crate::relay::error::AuthError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;

/**
 * Bearer token and the account it belongs to
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub token: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/**
 * On-disk copy of the session
 * A store without a path keeps nothing across restarts
 */
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: Option<PathBuf>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self { path: None }
    }

    fn persistence_error(path: &Path, source: std::io::Error) -> AuthError {
        AuthError::Persistence {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn load(&self) -> Result<Option<SessionCredentials>, AuthError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path).map_err(|e| Self::persistence_error(path, e))?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /**
     * Write atomically via temporary file + rename
     */
    pub fn save(&self, credentials: &SessionCredentials) -> Result<(), AuthError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::persistence_error(parent, e))?;
        }
        let contents = serde_json::to_string_pretty(credentials)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, contents).map_err(|e| Self::persistence_error(&temp_path, e))?;
        fs::rename(&temp_path, path).map_err(|e| Self::persistence_error(path, e))?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), AuthError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::persistence_error(path, e)),
        }
    }
}

/**
 * Current session shared by the relay's tasks
 */
pub struct AuthSession {
    store: SessionStore,
    current: RwLock<Option<SessionCredentials>>,
    state_tx: watch::Sender<bool>,
}

impl AuthSession {
    pub fn new(store: SessionStore) -> Self {
        let (state_tx, _) = watch::channel(false);
        Self {
            store,
            current: RwLock::new(None),
            state_tx,
        }
    }

    /**
     * Reload a persisted session
     * Returns whether a session was found
     */
    pub fn restore(&self) -> Result<bool, AuthError> {
        let loaded = self.store.load()?;
        let found = loaded.is_some();
        if let Some(credentials) = &loaded {
            log::info!("Restored session for {}", credentials.username);
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        self.state_tx.send_replace(found);
        Ok(found)
    }

    pub fn credentials(&self) -> Option<SessionCredentials> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn username(&self) -> Option<String> {
        self.credentials().map(|c| c.username)
    }

    /**
     * Adopt new credentials
     * The file is written first so memory never holds an unpersisted session
     */
    pub fn establish(&self, credentials: SessionCredentials) -> Result<(), AuthError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        self.store.save(&credentials)?;
        log::info!("Session established for {}", credentials.username);
        *current = Some(credentials);
        drop(current);

        self.state_tx.send_replace(true);
        Ok(())
    }

    /**
     * Replace the token after a successful delivery
     * Expiry is replaced only when the collector sent one
     * A session cleared in the meantime stays cleared
     */
    pub fn rotate(&self, new_token: String, new_expires_at: Option<String>) -> Result<(), AuthError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let Some(existing) = current.as_ref() else {
            log::debug!("Ignoring token rotation, no active session");
            return Ok(());
        };
        if existing.token == new_token && new_expires_at.is_none() {
            return Ok(());
        }

        let rotated = SessionCredentials {
            token: new_token,
            username: existing.username.clone(),
            expires_at: new_expires_at.or_else(|| existing.expires_at.clone()),
        };
        self.store.save(&rotated)?;
        *current = Some(rotated);
        log::debug!("Session token rotated");
        Ok(())
    }

    /**
     * Drop the session from memory and disk
     * Memory is cleared even if the file cannot be removed
     */
    pub fn clear(&self) -> Result<(), AuthError> {
        let previous = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state_tx.send_replace(false);
        if let Some(credentials) = previous {
            log::info!("Session cleared for {}", credentials.username);
        }
        self.store.remove()
    }

    /// Receive every authenticated/unauthenticated transition
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /**
     * Log in with username and password
     * A rejected login leaves the current session untouched
     */
    pub async fn login(
        &self,
        collector: &dyn Collector,
        username: &str,
        password: &str,
    ) -> Result<SessionCredentials, AuthError> {
        let credentials = collector.login(username, password).await?;
        self.establish(credentials.clone())?;
        Ok(credentials)
    }

    /**
     * Adopt the session of a logged-in website user
     */
    pub async fn sync_with_web_token(
        &self,
        collector: &dyn Collector,
        web_token: &str,
    ) -> Result<SessionCredentials, AuthError> {
        let credentials = collector.exchange_web_token(web_token).await?;
        self.establish(credentials.clone())?;
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::client::BatchReply;
    use crate::relay::error::DeliveryError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FakeAuthPlane;

    #[async_trait]
    impl Collector for FakeAuthPlane {
        async fn send_batch(
            &self,
            _token: &str,
            _conn: &str,
            _body: Vec<u8>,
            _gzip: bool,
        ) -> Result<BatchReply, DeliveryError> {
            Err(DeliveryError::Transport("not used".to_string()))
        }

        async fn probe_status(&self) -> bool {
            true
        }

        async fn login(&self, username: &str, password: &str) -> Result<SessionCredentials, AuthError> {
            if password == "secret" {
                Ok(creds("token-1", username))
            } else {
                Err(AuthError::Rejected("Invalid credentials".to_string()))
            }
        }

        async fn exchange_web_token(&self, web_token: &str) -> Result<SessionCredentials, AuthError> {
            if web_token == "web" {
                Ok(creds("token-web", "webuser"))
            } else {
                Err(AuthError::Rejected("Invalid token".to_string()))
            }
        }
    }

    fn creds(token: &str, username: &str) -> SessionCredentials {
        SessionCredentials {
            token: token.to_string(),
            username: username.to_string(),
            expires_at: None,
        }
    }

    fn session_in(dir: &TempDir) -> AuthSession {
        AuthSession::new(SessionStore::new(dir.path().join("session.json")))
    }

    #[tokio::test]
    async fn test_login_persists_and_restores() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let mut state = session.subscribe();

        session.login(&FakeAuthPlane, "alice", "secret").await.unwrap();
        assert!(session.is_authenticated());
        assert_eq!(session.username().as_deref(), Some("alice"));
        assert!(*state.borrow_and_update());

        let restored = session_in(&dir);
        assert!(restored.restore().unwrap());
        assert_eq!(restored.credentials(), Some(creds("token-1", "alice")));
    }

    #[tokio::test]
    async fn test_rejected_login_keeps_existing_session() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.establish(creds("old", "bob")).unwrap();

        let err = session.login(&FakeAuthPlane, "alice", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected(_)));
        assert_eq!(session.credentials(), Some(creds("old", "bob")));
    }

    #[tokio::test]
    async fn test_sync_with_web_token() {
        let session = AuthSession::new(SessionStore::in_memory());
        let credentials = session.sync_with_web_token(&FakeAuthPlane, "web").await.unwrap();
        assert_eq!(credentials.username, "webuser");
        assert!(session.is_authenticated());

        assert!(session.sync_with_web_token(&FakeAuthPlane, "bad").await.is_err());
        assert_eq!(session.username().as_deref(), Some("webuser"));
    }

    #[test]
    fn test_rotation_replaces_token_in_memory_and_on_disk() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session
            .establish(SessionCredentials {
                expires_at: Some("2030-01-01T00:00:00Z".to_string()),
                ..creds("t1", "alice")
            })
            .unwrap();

        session.rotate("t2".to_string(), None).unwrap();
        let current = session.credentials().unwrap();
        assert_eq!(current.token, "t2");
        assert_eq!(current.expires_at.as_deref(), Some("2030-01-01T00:00:00Z"));

        session
            .rotate("t3".to_string(), Some("2031-01-01T00:00:00Z".to_string()))
            .unwrap();
        let on_disk = SessionStore::new(dir.path().join("session.json"))
            .load()
            .unwrap()
            .unwrap();
        assert_eq!(on_disk.token, "t3");
        assert_eq!(on_disk.username, "alice");
        assert_eq!(on_disk.expires_at.as_deref(), Some("2031-01-01T00:00:00Z"));
    }

    #[test]
    fn test_rotation_after_logout_does_not_resurrect_session() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.establish(creds("t1", "alice")).unwrap();
        session.clear().unwrap();

        session.rotate("t2".to_string(), None).unwrap();
        assert!(!session.is_authenticated());
        assert!(!dir.path().join("session.json").exists());
    }

    #[test]
    fn test_clear_publishes_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        session.establish(creds("t1", "alice")).unwrap();
        let mut state = session.subscribe();
        assert!(*state.borrow_and_update());

        session.clear().unwrap();
        assert!(!*state.borrow_and_update());
        assert!(!dir.path().join("session.json").exists());

        // Clearing twice is harmless
        session.clear().unwrap();
        assert!(!session_in(&dir).restore().unwrap());
    }
}
