//! Cancellation support for analysis sessions
//!
//! Allows interrupting an in-flight request and its read loop.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::session::SessionState;

/// Cancellation handle scoped to a single session
#[derive(Clone)]
pub struct SessionCancellation {
    session_id: Uuid,
    token: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionCancellation {
    pub(crate) fn new(session_id: Uuid, state: Arc<watch::Sender<SessionState>>) -> Self {
        Self {
            session_id,
            token: CancellationToken::new(),
            state,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Stop the request and the read loop. Idempotent; a settled or
    /// superseded session is left untouched.
    pub fn cancel(&self) {
        self.token.cancel();

        let id = self.session_id;
        let changed = self.state.send_if_modified(|state| {
            if state.session_id != Some(id) || !state.is_active {
                return false;
            }
            state.is_active = false;
            state.is_streaming = false;
            true
        });
        if changed {
            info!(session = %id, "Analysis session cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token the session task selects on
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl std::fmt::Debug for SessionCancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCancellation")
            .field("session_id", &self.session_id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
