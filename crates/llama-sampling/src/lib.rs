//! # llama-sampling
//!
//! Sampler chain configuration for llama-chat.
//!
//! A [`SamplerChain`] is the ordered list of transforms a runtime applies to
//! the logits of the last decoded position before drawing the next token:
//! - Temperature scaling
//! - Top-k filtering
//! - Top-p (nucleus) filtering
//! - Min-p filtering
//! - Repetition penalty
//! - A terminal draw: greedy (argmax) or seeded distribution sampling
//!
//! The chain is immutable once built and validated; the runtime turns it into
//! its native sampler at model load time.

use serde::{Deserialize, Serialize};

/// Seed value asking the runtime to pick a random seed.
pub const RANDOM_SEED: u32 = u32::MAX;

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("sampler chain is empty")]
    Empty,
    #[error("temperature must be > 0 (got {0})")]
    InvalidTemperature(f32),
    #[error("top-k must be > 0 (got {0})")]
    InvalidTopK(i32),
    #[error("{stage} probability must be in (0, 1] (got {p})")]
    InvalidProbability { stage: &'static str, p: f32 },
    #[error("repetition penalty must be > 0 (got {0})")]
    InvalidPenalty(f32),
    #[error("chain must end with a greedy or distribution draw")]
    MissingTerminal,
    #[error("draw stage at position {0} is not last")]
    TerminalNotLast(usize),
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// A single transform in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerStage {
    /// Divide logits by `t`. > 1.0 = more random, < 1.0 = more deterministic.
    Temperature { t: f32 },
    /// Keep the `k` most likely tokens.
    TopK { k: i32 },
    /// Keep the smallest set of tokens with cumulative probability >= `p`.
    TopP { p: f32, min_keep: usize },
    /// Drop tokens whose probability is below `p` times the most likely one.
    MinP { p: f32, min_keep: usize },
    /// Penalize tokens seen in the last `last_n` positions.
    RepetitionPenalty { last_n: i32, penalty: f32 },
    /// Pick the most likely token.
    Greedy,
    /// Draw from the distribution with a seeded RNG.
    Distribution { seed: u32 },
}

impl SamplerStage {
    fn is_terminal(&self) -> bool {
        matches!(self, SamplerStage::Greedy | SamplerStage::Distribution { .. })
    }

    fn validate(&self) -> SamplingResult<()> {
        match *self {
            SamplerStage::Temperature { t } if !(t > 0.0) => {
                Err(SamplingError::InvalidTemperature(t))
            }
            SamplerStage::TopK { k } if k <= 0 => Err(SamplingError::InvalidTopK(k)),
            SamplerStage::TopP { p, .. } if !(p > 0.0 && p <= 1.0) => {
                Err(SamplingError::InvalidProbability { stage: "top-p", p })
            }
            SamplerStage::MinP { p, .. } if !(p > 0.0 && p <= 1.0) => {
                Err(SamplingError::InvalidProbability { stage: "min-p", p })
            }
            SamplerStage::RepetitionPenalty { penalty, .. } if !(penalty > 0.0) => {
                Err(SamplingError::InvalidPenalty(penalty))
            }
            _ => Ok(()),
        }
    }
}

/// Ordered sampler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SamplerChain {
    stages: Vec<SamplerStage>,
}

impl SamplerChain {
    /// An empty chain; add stages with the `with_*` builders.
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Argmax only.
    pub fn greedy() -> Self {
        Self::new().with_greedy()
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.stages.push(SamplerStage::Temperature { t });
        self
    }

    pub fn with_top_k(mut self, k: i32) -> Self {
        self.stages.push(SamplerStage::TopK { k });
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.stages.push(SamplerStage::TopP { p, min_keep: 1 });
        self
    }

    pub fn with_min_p(mut self, p: f32) -> Self {
        self.stages.push(SamplerStage::MinP { p, min_keep: 1 });
        self
    }

    pub fn with_repetition_penalty(mut self, last_n: i32, penalty: f32) -> Self {
        self.stages
            .push(SamplerStage::RepetitionPenalty { last_n, penalty });
        self
    }

    pub fn with_greedy(mut self) -> Self {
        self.stages.push(SamplerStage::Greedy);
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.stages.push(SamplerStage::Distribution { seed });
        self
    }

    /// Replace the temperature of every temperature stage, inserting one in
    /// front of the terminal draw if the chain has none.
    pub fn override_temperature(mut self, t: f32) -> Self {
        let mut found = false;
        for stage in &mut self.stages {
            if let SamplerStage::Temperature { t: current } = stage {
                *current = t;
                found = true;
            }
        }
        if !found {
            let at = self
                .stages
                .iter()
                .position(SamplerStage::is_terminal)
                .unwrap_or(self.stages.len());
            self.stages.insert(at, SamplerStage::Temperature { t });
        }
        self
    }

    /// Replace the seed of the distribution draw, if any.
    pub fn override_seed(mut self, seed: u32) -> Self {
        for stage in &mut self.stages {
            if let SamplerStage::Distribution { seed: current } = stage {
                *current = seed;
            }
        }
        self
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    /// Check every stage and that exactly the last stage is a draw.
    pub fn validate(&self) -> SamplingResult<()> {
        if self.stages.is_empty() {
            return Err(SamplingError::Empty);
        }
        for (i, stage) in self.stages.iter().enumerate() {
            stage.validate()?;
            if stage.is_terminal() && i + 1 != self.stages.len() {
                return Err(SamplingError::TerminalNotLast(i));
            }
        }
        match self.stages.last() {
            Some(stage) if stage.is_terminal() => Ok(()),
            _ => Err(SamplingError::MissingTerminal),
        }
    }
}

impl Default for SamplerChain {
    /// Temperature 0.7, nucleus 0.9, random-seeded draw.
    fn default() -> Self {
        Self::new()
            .with_temperature(0.7)
            .with_top_p(0.9)
            .with_seed(RANDOM_SEED)
    }
}
