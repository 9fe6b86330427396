//! # llama-kv
//!
//! Conversation continuation state for llama-chat.
//!
//! The runtime owns the actual key/value tensors; this crate tracks what is in
//! them. [`SessionState`] records:
//! - **Token history**: every token fed to the context across all turns
//! - **Cache position**: how many of those tokens the context has decoded
//! - **Capacity**: the context window, so overflow is caught before decoding
//!
//! Tokens are first *staged* (appended to the history), then either
//! *committed* once the runtime has decoded them or *rolled back* if it failed.

/// Error type for session state operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("Context window exceeded: {needed} tokens > {capacity}")]
    CapacityExceeded { needed: usize, capacity: usize },

    #[error("Cannot stage an empty token sequence")]
    EmptyStage,

    #[error("{pending} staged tokens not yet committed or rolled back")]
    Uncommitted { pending: usize },
}

pub type KvResult<T> = Result<T, KvError>;

/// Token history plus the number of tokens folded into the runtime's cache.
///
/// # Invariants
/// - `cache_position() <= len() <= capacity()`
/// - `commit()` advances the cache position by exactly the staged count
/// - at most one staged span exists at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// Ordered token ids, oldest first.
    history: Vec<i32>,
    /// Tokens of `history` already decoded into the context.
    cache_position: usize,
    /// Context window in tokens.
    capacity: usize,
}

impl SessionState {
    /// Create an empty state for a context window of `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Vec::new(),
            cache_position: 0,
            capacity,
        }
    }

    /// Append `tokens` to the history without advancing the cache position.
    ///
    /// Returns the position the first staged token must be decoded at.
    pub fn stage(&mut self, tokens: &[i32]) -> KvResult<usize> {
        if tokens.is_empty() {
            return Err(KvError::EmptyStage);
        }
        let pending = self.pending();
        if pending > 0 {
            return Err(KvError::Uncommitted { pending });
        }
        let needed = self.history.len() + tokens.len();
        if needed > self.capacity {
            return Err(KvError::CapacityExceeded {
                needed,
                capacity: self.capacity,
            });
        }
        self.history.extend_from_slice(tokens);
        Ok(self.cache_position)
    }

    /// Mark every staged token as decoded. Returns how many were committed.
    pub fn commit(&mut self) -> usize {
        let committed = self.pending();
        self.cache_position = self.history.len();
        committed
    }

    /// Drop every staged token. Returns how many were removed.
    pub fn rollback(&mut self) -> usize {
        let removed = self.pending();
        self.history.truncate(self.cache_position);
        removed
    }

    /// Forget the whole conversation.
    pub fn reset(&mut self) {
        self.history.clear();
        self.cache_position = 0;
    }

    pub fn tokens(&self) -> &[i32] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn cache_position(&self) -> usize {
        self.cache_position
    }

    /// Staged tokens awaiting commit or rollback.
    pub fn pending(&self) -> usize {
        self.history.len() - self.cache_position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left in the context window.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.history.len())
    }
}
