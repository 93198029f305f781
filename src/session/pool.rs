//! The session registry (§3 `Session`, §4.G): a FIFO pool of [`ServerSession`]s keyed by nothing
//! more than their position in the queue — `lsid`s are fungible, so any idle session can be
//! handed to any caller that needs one.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bson::{doc, spec::BinarySubtype, Binary, Document};
use tokio::sync::Mutex;
use uuid::Uuid;

/// How close to `logical_session_timeout_minutes` a session may get before it's discarded
/// instead of reused (§4.G: "sessions whose idle time approaches ... are discarded rather than
/// used"). A conservative one-minute margin.
const IDLE_MARGIN: Duration = Duration::from_secs(60);

/// The client-side handle for a server-allocated logical session (§3 `Session::id`). Pooled and
/// may be associated with many [`super::ClientSession`]s over its lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    pub(crate) id: Document,
    last_use: Instant,
    pub(crate) dirty: bool,
    pub(crate) txn_number: i64,
}

impl ServerSession {
    pub(crate) fn new() -> Self {
        let binary = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        };
        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
        }
    }

    fn touch(&mut self) {
        self.last_use = Instant::now();
    }

    /// Whether the server would already consider this session expired, or will within
    /// [`IDLE_MARGIN`] (§4.G).
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let Some(timeout) = logical_session_timeout else {
            return false;
        };
        self.last_use + timeout < Instant::now() + IDLE_MARGIN
    }
}

/// The pool of idle [`ServerSession`]s owned by a client (§4.G). Dirty sessions are discarded
/// rather than returned (§3 `Session::is_dirty`); so are sessions nearing server-side
/// expiration.
#[derive(Debug, Default)]
pub(crate) struct SessionPool {
    idle: Mutex<VecDeque<ServerSession>>,
}

impl SessionPool {
    pub(crate) fn new() -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns an idle session, first evicting anything too close to expiring, or allocates a
    /// fresh one if the pool is empty (§4.G `checkout`).
    pub(crate) async fn check_out(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        let mut idle = self.idle.lock().await;
        while let Some(session) = idle.pop_front() {
            if session.is_about_to_expire(logical_session_timeout) {
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Returns a session to the front of the pool (§4.G: "pushes it to the front ... if not
    /// dirty"), evicting anything stale from the back first. A dirty or near-expired session is
    /// discarded instead.
    pub(crate) async fn check_in(&self, mut session: ServerSession, logical_session_timeout: Option<Duration>) {
        let mut idle = self.idle.lock().await;
        while let Some(back) = idle.back() {
            if back.is_about_to_expire(logical_session_timeout) {
                idle.pop_back();
            } else {
                break;
            }
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            session.touch();
            idle.push_front(session);
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.idle.lock().await.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn checkout_allocates_when_empty() {
        let pool = SessionPool::new();
        let session = pool.check_out(Some(Duration::from_secs(1800))).await;
        assert!(!session.dirty);
        assert_eq!(session.txn_number, 0);
    }

    #[tokio::test]
    async fn checkin_then_checkout_reuses_session() {
        let pool = SessionPool::new();
        let session = pool.check_out(None).await;
        let id = session.id.clone();
        pool.check_in(session, None).await;
        assert_eq!(pool.len().await, 1);

        let reused = pool.check_out(None).await;
        assert_eq!(reused.id, id);
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn dirty_session_is_discarded_on_checkin() {
        let pool = SessionPool::new();
        let mut session = pool.check_out(None).await;
        session.dirty = true;
        pool.check_in(session, None).await;
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn near_expiry_session_is_discarded_on_checkin() {
        let pool = SessionPool::new();
        let mut session = ServerSession::new();
        session.last_use = Instant::now() - Duration::from_secs(3600);
        pool.check_in(session, Some(Duration::from_secs(1800))).await;
        assert_eq!(pool.len().await, 0);
    }
}
