//! Decode batches.
//!
//! A [`Batch`] is an owned, validated list of `(token, position, logits)`
//! entries for sequence 0. Runtimes translate it into their native batch type
//! at the decode call.

use crate::{Result, RuntimeError, TokenId};

/// One token slot in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: i32,
    /// Request output logits for this position.
    pub logits: bool,
}

/// A validated decode batch.
///
/// # Invariants
/// - never empty
/// - positions are strictly consecutive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn builder(capacity: usize) -> BatchBuilder {
        BatchBuilder {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Prompt batch starting at `start_pos`, with logits only for the final token.
    pub fn prompt(tokens: &[TokenId], start_pos: usize) -> Result<Self> {
        let mut builder = Self::builder(tokens.len());
        let last = tokens.len().saturating_sub(1);
        for (i, &token) in tokens.iter().enumerate() {
            builder.push(token, (start_pos + i) as i32, i == last)?;
        }
        builder.build()
    }

    /// Single generated token at `pos`, with logits.
    pub fn single(token: TokenId, pos: usize) -> Self {
        Self {
            entries: vec![BatchEntry {
                token,
                pos: pos as i32,
                logits: true,
            }],
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of the first entry.
    pub fn start_pos(&self) -> i32 {
        self.entries.first().map_or(0, |e| e.pos)
    }

    pub fn tokens(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.entries.iter().map(|e| e.token)
    }

    /// Number of entries that request logits.
    pub fn n_outputs(&self) -> usize {
        self.entries.iter().filter(|e| e.logits).count()
    }
}

/// Incremental builder for [`Batch`].
#[derive(Debug)]
pub struct BatchBuilder {
    capacity: usize,
    entries: Vec<BatchEntry>,
}

impl BatchBuilder {
    pub fn push(&mut self, token: TokenId, pos: i32, logits: bool) -> Result<&mut Self> {
        if self.entries.len() >= self.capacity {
            return Err(RuntimeError::InvalidBatch(format!(
                "batch capacity {} exceeded",
                self.capacity
            )));
        }
        if let Some(prev) = self.entries.last() {
            if pos != prev.pos + 1 {
                return Err(RuntimeError::InvalidBatch(format!(
                    "position {pos} does not follow {}",
                    prev.pos
                )));
            }
        }
        self.entries.push(BatchEntry { token, pos, logits });
        Ok(self)
    }

    pub fn build(self) -> Result<Batch> {
        if self.entries.is_empty() {
            return Err(RuntimeError::InvalidBatch("empty batch".into()));
        }
        Ok(Batch {
            entries: self.entries,
        })
    }
}
