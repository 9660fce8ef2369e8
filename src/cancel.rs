//! Cancellation signal and group.
//!
//! The source relies on closing the in-flight HTTP transport to unblock a
//! pending response (§9). `reqwest` has no explicit "close a request"
//! operation, so the Rust analogue is: every range fetch runs as its own
//! `tokio` task, and the [`CancelToken`] holds that task's
//! [`tokio::task::AbortHandle`] instead of a raw client handle. Aborting the
//! task has the same effect the source describes — the pending response
//! future is dropped mid-flight and the attempt fails.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;

use crate::error::{Error, Result};

/// Identifies one `register_client` call, so a stale `unregister_client`
/// can't clear a slot a newer registration already owns.
pub(crate) type RegistrationId = u64;

struct Inner {
    cancelled: AtomicBool,
    next_registration: AtomicU64,
    active: Mutex<Option<(RegistrationId, AbortHandle)>>,
}

/// A shared, cheaply-cloneable one-shot cancellation flag with a single
/// "currently active client" slot.
///
/// `cancel()` is idempotent and safe to call from any task at any time
/// without an `&mut self` (§9, "shared mutable cancellation token").
#[derive(Clone)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    /// Create a fresh, non-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            next_registration: AtomicU64::new(0),
            active: Mutex::new(None),
        }))
    }

    /// Set the cancelled flag and abort the currently-registered client, if
    /// any. Idempotent: calling this more than once has no additional
    /// effect.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        if let Some((_, handle)) = self.0.active.lock().expect("cancel token lock poisoned").take() {
            handle.abort();
        }
    }

    /// True once [`CancelToken::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Raise [`Error::Cancelled`] if the flag is set. Call this at every
    /// suspension point before beginning new work (§5).
    pub fn throw_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Register the abort handle for a request currently in flight, and
    /// return an id identifying this registration.
    ///
    /// Only the most recently registered handle is retained (§3): a second
    /// call replaces the first without aborting it. If the token is already
    /// cancelled, the handle is aborted immediately so races between
    /// `cancel()` and a new request are safe. Callers that clone this token
    /// across concurrently in-flight requests (the chunk scheduler does,
    /// one per dispatched range) must pass the returned id back to
    /// `unregister_client` so a fast-finishing request can't clear a slot a
    /// still in-flight request has since claimed.
    pub(crate) fn register_client(&self, handle: AbortHandle) -> RegistrationId {
        let id = self.0.next_registration.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.0.active.lock().expect("cancel token lock poisoned");
        if self.is_cancelled() {
            handle.abort();
            *slot = None;
        } else {
            *slot = Some((id, handle));
        }
        id
    }

    /// Clear the active-client slot without aborting it (the request
    /// finished on its own), but only if it still holds the registration
    /// identified by `id` — a newer registration already replaced it
    /// otherwise, and must not be cleared.
    pub(crate) fn unregister_client(&self, id: RegistrationId) {
        let mut slot = self.0.active.lock().expect("cancel token lock poisoned");
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
    }

    fn ptr_eq(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate of [`CancelToken`]s owned by one engine instance.
///
/// Membership is identity-based (`Arc` pointer equality), so
/// [`CancelTokenGroup::add_token`] is a no-op for a token already present.
#[derive(Default, Clone)]
pub struct CancelTokenGroup {
    tokens: Arc<Mutex<Vec<CancelToken>>>,
}

impl CancelTokenGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new token and add it to the group.
    #[must_use]
    pub fn create_token(&self) -> CancelToken {
        let token = CancelToken::new();
        self.add_token(token.clone());
        token
    }

    /// Add a token to the group. A no-op if an identical (same underlying
    /// `Arc`) token is already present.
    pub fn add_token(&self, token: CancelToken) {
        let mut tokens = self.tokens.lock().expect("cancel group lock poisoned");
        if !tokens.iter().any(|t| t.ptr_eq(&token)) {
            tokens.push(token);
        }
    }

    /// Remove a token from the group without cancelling it.
    pub fn remove_token(&self, token: &CancelToken) {
        let mut tokens = self.tokens.lock().expect("cancel group lock poisoned");
        tokens.retain(|t| !t.ptr_eq(token));
    }

    /// Cancel every token currently in the group.
    pub fn cancel_all(&self) {
        let tokens = self.tokens.lock().expect("cancel group lock poisoned");
        for token in tokens.iter() {
            token.cancel();
        }
    }

    /// Drop all references without cancelling them.
    pub fn clear(&self) {
        self.tokens.lock().expect("cancel group lock poisoned").clear();
    }

    /// [`CancelTokenGroup::cancel_all`] followed by [`CancelTokenGroup::clear`].
    pub fn cancel_and_clear(&self) {
        self.cancel_all();
        self.clear();
    }

    /// Number of tokens currently in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.lock().expect("cancel group lock poisoned").len()
    }

    /// True if the group has no tokens.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if at least one token in the group is cancelled.
    #[must_use]
    pub fn is_any_cancelled(&self) -> bool {
        self.tokens
            .lock()
            .expect("cancel group lock poisoned")
            .iter()
            .any(CancelToken::is_cancelled)
    }

    /// True if every token in the group is cancelled (and the group is
    /// non-empty).
    #[must_use]
    pub fn are_all_cancelled(&self) -> bool {
        let tokens = self.tokens.lock().expect("cancel group lock poisoned");
        !tokens.is_empty() && tokens.iter().all(CancelToken::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn throw_if_cancelled_raises_once_flagged() {
        let token = CancelToken::new();
        assert!(token.throw_if_cancelled().is_ok());
        token.cancel();
        assert_eq!(token.throw_if_cancelled().unwrap_err().code(), crate::ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn registering_after_cancel_aborts_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        token.register_client(handle.abort_handle());

        let result = handle.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn cancel_aborts_the_registered_client() {
        let token = CancelToken::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        token.register_client(handle.abort_handle());
        token.cancel();

        let result = handle.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn stale_unregister_does_not_clear_a_newer_registration() {
        let token = CancelToken::new();

        let first = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let first_id = token.register_client(first.abort_handle());
        first.abort();
        let _ = first.await;

        let second = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        token.register_client(second.abort_handle());

        // A late unregister carrying the first (now-stale) id must not
        // clear the slot the second registration owns.
        token.unregister_client(first_id);
        token.cancel();

        let result = second.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn group_add_token_is_a_no_op_for_duplicates() {
        let group = CancelTokenGroup::new();
        let token = CancelToken::new();
        group.add_token(token.clone());
        group.add_token(token.clone());
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn group_cancel_all_cancels_every_member() {
        let group = CancelTokenGroup::new();
        let a = group.create_token();
        let b = group.create_token();
        group.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(group.are_all_cancelled());
    }

    #[test]
    fn group_clear_drops_without_cancelling() {
        let group = CancelTokenGroup::new();
        let token = group.create_token();
        group.clear();
        assert!(group.is_empty());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn group_cancel_and_clear_composes_both() {
        let group = CancelTokenGroup::new();
        let token = group.create_token();
        group.cancel_and_clear();
        assert!(token.is_cancelled());
        assert!(group.is_empty());
    }
}
