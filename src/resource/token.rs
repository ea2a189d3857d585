// src/resource/token.rs

//! Counted tokens bounding how many consumers may run at once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::LockError;
use crate::resource::ResourceId;

/// Snapshot of a token's capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub limit: u32,
    pub used: u32,
}

/// The live counter behind a token resource.
///
/// It has its own monitor: acquiring and releasing tokens does not depend
/// on any particular job or transaction.
#[derive(Debug)]
pub struct TokenCounter {
    usage: Mutex<TokenUsage>,
}

impl TokenCounter {
    pub fn new(limit: u32) -> Self {
        Self::with_usage(TokenUsage { limit, used: 0 })
    }

    fn with_usage(usage: TokenUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
        }
    }

    fn guard(&self) -> MutexGuard<'_, TokenUsage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn usage(&self) -> TokenUsage {
        *self.guard()
    }

    pub fn can_acquire(&self, tokens: u32) -> bool {
        let usage = self.guard();
        usage.used.saturating_add(tokens) <= usage.limit
    }

    /// Take `tokens` or fail without waiting.
    pub fn try_acquire(&self, token: ResourceId, tokens: u32) -> Result<(), LockError> {
        let mut usage = self.guard();
        let wanted = usage.used.saturating_add(tokens);
        if wanted > usage.limit {
            return Err(LockError::TokensExhausted {
                token,
                used: usage.used,
                requested: tokens,
                limit: usage.limit,
            });
        }
        usage.used = wanted;
        debug!(%token, used = usage.used, limit = usage.limit, "tokens acquired");
        Ok(())
    }

    pub fn release(&self, token: ResourceId, tokens: u32) {
        let mut usage = self.guard();
        if tokens > usage.used {
            warn!(
                %token,
                used = usage.used,
                released = tokens,
                "releasing more tokens than held; resetting to 0"
            );
            usage.used = 0;
        } else {
            usage.used -= tokens;
        }
        debug!(%token, used = usage.used, limit = usage.limit, "tokens released");
    }

    /// Change the limit. Returns true when the token was blocking before and
    /// no longer is.
    pub fn set_limit(&self, limit: u32) -> bool {
        let mut usage = self.guard();
        let was_blocking = usage.used >= usage.limit;
        usage.limit = limit;
        was_blocking && usage.used < limit
    }

    pub(crate) fn set_used(&self, used: u32) {
        self.guard().used = used;
    }
}

/// Token payload of a resource record.
///
/// Clones share the same counter; the record serializes as a plain
/// [`TokenUsage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TokenUsage", into = "TokenUsage")]
pub struct TokenDetails {
    counter: Arc<TokenCounter>,
}

impl TokenDetails {
    pub fn new(limit: u32) -> Self {
        Self {
            counter: Arc::new(TokenCounter::new(limit)),
        }
    }

    pub fn counter(&self) -> &Arc<TokenCounter> {
        &self.counter
    }

    pub fn limit(&self) -> u32 {
        self.counter.usage().limit
    }

    pub fn used(&self) -> u32 {
        self.counter.usage().used
    }
}

impl From<TokenUsage> for TokenDetails {
    fn from(usage: TokenUsage) -> Self {
        Self {
            counter: Arc::new(TokenCounter::with_usage(usage)),
        }
    }
}

impl From<TokenDetails> for TokenUsage {
    fn from(details: TokenDetails) -> Self {
        details.counter.usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_fails_at_limit() {
        let counter = TokenCounter::new(2);
        let id = ResourceId(1);
        counter.try_acquire(id, 1).unwrap();
        counter.try_acquire(id, 1).unwrap();
        let err = counter.try_acquire(id, 1).unwrap_err();
        assert!(matches!(err, LockError::TokensExhausted { used: 2, limit: 2, .. }));
        assert_eq!(counter.usage().used, 2);
    }

    #[test]
    fn release_clamps_at_zero() {
        let counter = TokenCounter::new(3);
        counter.try_acquire(ResourceId(1), 1).unwrap();
        counter.release(ResourceId(1), 5);
        assert_eq!(counter.usage().used, 0);
    }

    #[test]
    fn raising_limit_reports_unblocking() {
        let counter = TokenCounter::new(1);
        counter.try_acquire(ResourceId(1), 1).unwrap();
        assert!(!counter.can_acquire(1));
        assert!(counter.set_limit(2));
        assert!(counter.can_acquire(1));
        assert!(!counter.set_limit(3));
    }

    #[test]
    fn details_serialize_as_usage() {
        let details = TokenDetails::new(4);
        details.counter().try_acquire(ResourceId(7), 3).unwrap();
        let json = serde_json::to_string(&details).unwrap();
        assert_eq!(json, r#"{"limit":4,"used":3}"#);
        let back: TokenDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back.used(), 3);
        assert_eq!(back.limit(), 4);
    }
}
