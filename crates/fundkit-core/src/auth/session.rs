use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::store::AuthProvider;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Buffer time before expiry to trigger refresh (5 minutes)
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionData {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        Utc::now() > self.expires_at - Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_minutes().max(0)
    }
}

pub struct Session {
    cache_dir: PathBuf,
    pub data: Option<SessionData>,
}

impl Session {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            data: None,
        }
    }

    /// Load session from disk. Expired sessions are kept so their refresh
    /// token can still be used; returns whether the loaded token is usable as is.
    pub fn load(&mut self) -> Result<bool> {
        let path = self.session_path();
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read session file")?;
            let data: SessionData = serde_json::from_str(&contents)
                .context("Failed to parse session file")?;

            let usable = !data.is_expired();
            self.data = Some(data);
            return Ok(usable);
        }
        Ok(false)
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        if let Some(ref data) = self.data {
            let path = self.session_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(data)?;
            std::fs::write(path, contents)?;
        }
        Ok(())
    }

    /// Clear session data
    pub fn clear(&mut self) -> Result<()> {
        self.data = None;
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Update session with new data
    pub fn update(&mut self, data: SessionData) {
        self.data = Some(data);
    }

    /// Get the bearer token if session is valid
    pub fn token(&self) -> Option<&str> {
        self.data
            .as_ref()
            .filter(|d| !d.is_expired())
            .map(|d| d.access_token.as_str())
    }

    /// Check if session is valid (exists and not expired)
    pub fn is_valid(&self) -> bool {
        self.data.as_ref().map(|d| !d.is_expired()).unwrap_or(false)
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

impl AuthProvider for Session {
    fn current_user_id(&self) -> Option<String> {
        self.data
            .as_ref()
            .filter(|d| !d.is_expired())
            .map(|d| d.user_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(expires_in_minutes: i64) -> SessionData {
        SessionData {
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            user_id: "user-1".to_string(),
            email: "admin@example.org".to_string(),
            expires_at: Utc::now() + Duration::minutes(expires_in_minutes),
        }
    }

    #[test]
    fn test_session_expiry_windows() {
        let fresh = data(60);
        assert!(!fresh.is_expired());
        assert!(!fresh.needs_refresh());

        let closing = data(3);
        assert!(!closing.is_expired());
        assert!(closing.needs_refresh());

        let stale = data(-1);
        assert!(stale.is_expired());
        assert_eq!(stale.minutes_until_expiry(), 0);
    }

    #[test]
    fn test_current_user_requires_live_session() {
        let dir = std::env::temp_dir().join("fundkit-session-test-identity");
        let mut session = Session::new(dir);
        assert_eq!(session.current_user_id(), None);

        session.update(data(30));
        assert_eq!(session.current_user_id().as_deref(), Some("user-1"));
        assert_eq!(session.token(), Some("token"));

        session.update(data(-5));
        assert_eq!(session.current_user_id(), None);
        assert_eq!(session.token(), None);
    }

    #[test]
    fn test_session_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("fundkit-session-test-{}", std::process::id()));
        let mut session = Session::new(dir.clone());
        session.update(data(30));
        session.save().expect("save session");

        let mut loaded = Session::new(dir.clone());
        assert!(loaded.load().expect("load session"));
        assert_eq!(loaded.data.as_ref().map(|d| d.user_id.as_str()), Some("user-1"));

        loaded.clear().expect("clear session");
        assert!(!dir.join(SESSION_FILE).exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
