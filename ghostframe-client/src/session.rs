use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    display_name: String,
    active: bool,
}

impl Session {
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no active session")]
    Inactive,
    #[error("a session is already active")]
    AlreadyActive,
}

/// Holds at most one live session.
#[derive(Debug, Default)]
pub struct SessionManager {
    current: Option<Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, display_name: &str) -> Result<Session, SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        let session = Session {
            display_name: display_name.to_owned(),
            active: true,
        };
        self.current = Some(session.clone());
        info!(display_name, "session started");
        Ok(session)
    }

    /// Ends the session and returns it marked inactive.
    pub fn clear(&mut self) -> Option<Session> {
        let mut session = self.current.take()?;
        session.active = false;
        info!(display_name = %session.display_name, "session ended");
        Some(session)
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.current.as_ref().is_some_and(Session::is_active)
    }

    pub fn require(&self) -> Result<&Session, SessionError> {
        self.current
            .as_ref()
            .filter(|session| session.active)
            .ok_or(SessionError::Inactive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_session_at_a_time() {
        let mut sessions = SessionManager::new();
        let alice = sessions.activate("Alice").unwrap();
        assert!(alice.is_active());
        assert_eq!(
            sessions.activate("Bob").unwrap_err(),
            SessionError::AlreadyActive
        );
        assert_eq!(sessions.require().unwrap().display_name(), "Alice");
    }

    #[test]
    fn clear_invalidates_and_allows_new_login() {
        let mut sessions = SessionManager::new();
        sessions.activate("Alice").unwrap();

        let ended = sessions.clear().unwrap();
        assert!(!ended.is_active());
        assert_eq!(sessions.require().unwrap_err(), SessionError::Inactive);
        assert!(sessions.clear().is_none());

        sessions.activate("Bob").unwrap();
        assert_eq!(sessions.current().unwrap().display_name(), "Bob");
    }
}
