//! Process-wide abort flag shared by every worker.
//!
//! Once triggered it never resets. Workers poll it between tasks; nothing
//! interrupts a task that is already running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A cloneable abort flag. All clones observe the same state.
#[derive(Clone, Default)]
pub struct AbortToken {
    aborted: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl AbortToken {
    /// Creates a fresh, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers the abort. The first reason recorded wins.
    pub fn trigger(&self, reason: impl Into<String>) {
        let mut r = self.reason.lock();
        if r.is_none() {
            *r = Some(reason.into());
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Returns true once the abort has been triggered.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// The reason passed to the first `trigger` call, if any.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

impl std::fmt::Debug for AbortToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortToken")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_clear() {
        let token = AbortToken::new();
        assert!(!token.is_aborted());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let token = AbortToken::new();
        let other = token.clone();
        other.trigger("disk on fire");
        assert!(token.is_aborted());
        assert_eq!(token.reason().as_deref(), Some("disk on fire"));
    }

    #[test]
    fn test_first_reason_wins() {
        let token = AbortToken::new();
        token.trigger("first");
        token.trigger("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }
}
