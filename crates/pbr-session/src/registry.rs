use crate::session::{SessionInit, ViewModelSession};
use crate::{PlaybackNotifier, SessionError};
use pbr_storage::ProfileStore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub hostname: String,
    pub url: String,
}

impl SessionKey {
    pub fn new(hostname: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            url: url.into(),
        }
    }
}

impl From<&SessionInit> for SessionKey {
    fn from(init: &SessionInit) -> Self {
        Self::new(init.hostname.clone(), init.url.clone())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.hostname, self.url)
    }
}

/// Live sessions of one UI surface.
pub struct SessionRegistry {
    store: Arc<dyn ProfileStore>,
    notifier: Arc<dyn PlaybackNotifier>,
    sessions: HashMap<SessionKey, ViewModelSession>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn ProfileStore>, notifier: Arc<dyn PlaybackNotifier>) -> Self {
        Self {
            store,
            notifier,
            sessions: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ProfileStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn PlaybackNotifier> {
        &self.notifier
    }

    /// Builds a fresh session from the store. A previous session for the
    /// same key is disposed first.
    pub fn activate(&mut self, init: SessionInit) -> Result<&mut ViewModelSession, SessionError> {
        let key = SessionKey::from(&init);
        self.teardown(&key);
        let session = ViewModelSession::open(init, self.store.clone(), self.notifier.clone())?;
        info!(event = "session_activate", key = %key);
        Ok(self.sessions.entry(key).or_insert(session))
    }

    pub fn get(&self, key: &SessionKey) -> Option<&ViewModelSession> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut ViewModelSession> {
        self.sessions.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn teardown(&mut self, key: &SessionKey) -> bool {
        match self.sessions.remove(key) {
            Some(mut session) => {
                session.dispose();
                info!(event = "session_teardown", key = %key);
                true
            }
            None => false,
        }
    }

    /// Surface close. Returns how many sessions were disposed.
    pub fn teardown_all(&mut self) -> usize {
        let count = self.sessions.len();
        for (_, mut session) in self.sessions.drain() {
            session.dispose();
        }
        if count > 0 {
            info!(event = "session_teardown_all", sessions = count);
        }
        count
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.teardown_all();
    }
}
