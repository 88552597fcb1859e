//! Registry of open transport sessions
//!
//! Overlays and bus connections register here when they open so shutdown
//! can close all of them in one place.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Something holding network resources until closed
#[async_trait]
pub trait Session: Send + Sync {
    fn name(&self) -> String;

    async fn close(&self);
}

/// Sessions opened by this process
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<Vec<Arc<dyn Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<dyn Session>) {
        debug!(session = %session.name(), "Session registered");
        self.sessions.lock().push(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close every registered session, newest first
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain(..).rev().collect();
        for session in sessions {
            debug!(session = %session.name(), "Closing session");
            session.close().await;
        }
    }
}
