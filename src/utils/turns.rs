//! Per-thread turn exclusivity and cooperative cancellation.
//!
//! One turn per thread at a time: a second caller gets `thread-busy`
//! immediately instead of queueing. The registered cancel sender fans in
//! the stop endpoint, client disconnects, and transport write failures.

use crate::errors::{ServerError, ServerResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// Cloneable cancellation token observed by the turn loop, provider streams,
/// and sandbox execs at every suspension point.
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never be cancelled. Useful for tests and one-shot
    /// internal calls. All instances share one process-wide channel.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<(watch::Sender<bool>, watch::Receiver<bool>)> =
            std::sync::OnceLock::new();
        let (_, rx) = NEVER.get_or_init(|| watch::channel(false));
        Self { rx: rx.clone() }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the token is cancelled. If the sender is dropped without
    /// cancelling (turn finished normally), this pends forever — callers
    /// always race it against real work in a `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone, no cancellation will ever arrive.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug)]
struct ActiveTurn {
    user_id: String,
    cancel_tx: watch::Sender<bool>,
}

/// Registry of in-flight turns keyed by thread id.
pub struct TurnRegistry {
    active: Arc<Mutex<HashMap<String, ActiveTurn>>>,
}

/// RAII guard for an acquired thread slot. Dropping it releases the thread.
#[derive(Debug)]
pub struct TurnGuard {
    thread_id: String,
    active: Arc<Mutex<HashMap<String, ActiveTurn>>>,
    token: CancelToken,
}

impl TurnGuard {
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        active.remove(&self.thread_id);
        debug!("turn released: {}", self.thread_id);
    }
}

impl TurnRegistry {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim the thread for one turn. Fails fast with `thread-busy` when a
    /// turn is already running on the same thread.
    pub fn begin(&self, thread_id: &str, user_id: &str) -> ServerResult<TurnGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(thread_id) {
            return Err(ServerError::ThreadBusy(thread_id.to_string()));
        }
        let (tx, rx) = watch::channel(false);
        active.insert(
            thread_id.to_string(),
            ActiveTurn {
                user_id: user_id.to_string(),
                cancel_tx: tx,
            },
        );
        debug!("turn claimed: {} by {}", thread_id, user_id);
        Ok(TurnGuard {
            thread_id: thread_id.to_string(),
            active: self.active.clone(),
            token: CancelToken { rx },
        })
    }

    /// Request cancellation of the running turn on a thread. Returns `false`
    /// when no turn is running or the caller does not own it.
    pub fn cancel(&self, thread_id: &str, user_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get(thread_id) {
            Some(turn) if turn.user_id == user_id => {
                let _ = turn.cancel_tx.send(true);
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self, thread_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.contains_key(thread_id)
    }
}

impl Default for TurnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_begin_on_same_thread_is_busy() {
        let registry = TurnRegistry::new();
        let _guard = registry.begin("t1", "alice").expect("first claim");
        let err = registry.begin("t1", "alice").unwrap_err();
        assert!(matches!(err, ServerError::ThreadBusy(_)));
        // Distinct threads are unaffected
        let _other = registry.begin("t2", "alice").expect("other thread");
    }

    #[tokio::test]
    async fn drop_releases_thread() {
        let registry = TurnRegistry::new();
        {
            let _guard = registry.begin("t1", "alice").unwrap();
            assert!(registry.is_running("t1"));
        }
        assert!(!registry.is_running("t1"));
        let _again = registry.begin("t1", "alice").expect("reusable after drop");
    }

    #[tokio::test]
    async fn cancel_requires_ownership() {
        let registry = TurnRegistry::new();
        let guard = registry.begin("t1", "alice").unwrap();
        assert!(!registry.cancel("t1", "mallory"));
        assert!(!guard.token().is_cancelled());
        assert!(registry.cancel("t1", "alice"));
        assert!(guard.token().is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let registry = TurnRegistry::new();
        let guard = registry.begin("t1", "alice").unwrap();
        let token = guard.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        registry.cancel("t1", "alice");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn never_token_is_inert() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let raced = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(raced.is_err(), "never() must not resolve");
    }
}
