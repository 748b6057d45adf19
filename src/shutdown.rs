//! Process-wide registry of running sessions, for stopping them all at exit.
//!
//! A session registers itself on construction and unregisters when it stops
//! or is dropped. Entries are weak, so the registry never keeps a session
//! alive.

use crate::session::{Session, SessionInner};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Weak;

static SESSIONS: Mutex<BTreeMap<u64, Weak<SessionInner>>> =
    parking_lot::const_mutex(BTreeMap::new());

pub(crate) fn register(id: u64, session: Weak<SessionInner>) {
    SESSIONS.lock().insert(id, session);
}

pub(crate) fn unregister(id: u64) -> bool {
    SESSIONS.lock().remove(&id).is_some()
}

/// Number of sessions that have not been stopped yet.
pub fn registered_sessions() -> usize {
    SESSIONS.lock().len()
}

/// Stop every registered session, waiting for each as [`Session::stop`]
/// does. Returns the number of sessions stopped.
pub fn stop_all() -> usize {
    let sessions: Vec<(u64, Weak<SessionInner>)> =
        std::mem::take(&mut *SESSIONS.lock()).into_iter().collect();

    let mut stopped = 0;
    for (id, weak) in sessions {
        let Some(inner) = weak.upgrade() else {
            continue;
        };
        tracing::debug!(session = id, "Stopping session at shutdown");
        if Session::from_inner(inner).stop() {
            stopped += 1;
        }
    }
    if stopped > 0 {
        tracing::info!(sessions = stopped, "Stopped sessions at shutdown");
    }
    stopped
}

/// Stops every registered session when dropped. Hold one in `main`.
#[must_use = "sessions are stopped when the guard is dropped"]
pub struct ShutdownGuard {
    _private: (),
}

pub fn guard() -> ShutdownGuard {
    ShutdownGuard { _private: () }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        stop_all();
    }
}
