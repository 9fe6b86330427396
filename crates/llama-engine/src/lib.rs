//! # llama-engine
//!
//! The "narrow waist" of the llama-chat stack. Defines the [`InferenceRuntime`]
//! trait that the generation worker drives, plus the plain data types that cross
//! it. Implementations can swap the llama.cpp binding for the scripted
//! [`mock::MockRuntime`] without changing the worker.
//!
//! ## Design Notes
//!
//! ### Ownership
//! Model, context and sampler handles are associated types owned by the caller.
//! Dropping a handle releases the native resource exactly once; there is no
//! explicit `free` in the trait. A context must be dropped before the model it
//! was created from.
//!
//! ### Reentrancy
//! Runtimes are `Send` but not `Sync`: a runtime and its handles are driven from
//! a single thread. Methods take `&self`, so implementations that keep
//! bookkeeping use interior mutability.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` to match the C API, where negative values are
//! never valid ids.

pub mod batch;
pub mod mock;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use batch::{Batch, BatchBuilder, BatchEntry};
pub use llama_sampling::{SamplerChain, SamplerStage};

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Errors reported by an [`InferenceRuntime`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("model rejected by runtime: {0}")]
    ModelRejected(String),
    #[error("context creation failed: {0}")]
    ContextCreation(String),
    #[error("sampler creation failed: {0}")]
    SamplerCreation(String),
    #[error("decode failed with status {status}")]
    Decode { status: i32 },
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
}

/// Parameters used when loading model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Number of layers to offload to the GPU (0 = CPU only).
    pub n_gpu_layers: u32,
    /// Memory-map the model file instead of reading it.
    pub use_mmap: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            use_mmap: true,
        }
    }
}

/// Parameters used when creating a context (and its KV cache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// Context window in tokens.
    pub n_ctx: u32,
    /// Maximum number of tokens in one decode batch.
    pub n_batch: u32,
    /// Threads used for decoding.
    pub n_threads: i32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_threads: 4,
        }
    }
}

/// Static facts about a loaded model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub description: String,
    pub n_params: u64,
    pub n_layers: i32,
    pub n_embd: i32,
    pub n_ctx_train: i32,
    pub n_vocab: i32,
}

/// Raw performance counters of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfCounters {
    /// Prompt tokens evaluated since the context was created.
    pub tokens_in: u64,
    /// Generated tokens evaluated since the context was created.
    pub tokens_out: u64,
    /// Time spent on prompt evaluation in milliseconds.
    pub prompt_eval_ms: f64,
    /// Time spent on single-token evaluation in milliseconds.
    pub eval_ms: f64,
}

/// The capability set the generation worker calls into.
///
/// Size-reporting methods follow the llama.cpp convention: a non-negative
/// return is the number of items written, a negative return `-n` means the
/// output buffer must hold `n` items.
pub trait InferenceRuntime: Send + 'static {
    type Model: Send;
    type Context: Send;
    type Sampler: Send;

    /// Load model weights and vocabulary from `path`.
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model>;

    /// Create a context (with an empty KV cache) bound to `model`.
    fn create_context(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context>;

    /// Build the sampler chain for `model`.
    fn create_sampler(&self, model: &Self::Model, chain: &SamplerChain) -> Result<Self::Sampler>;

    fn model_metadata(&self, model: &Self::Model) -> ModelMetadata;

    /// Tokenize `text` into `out`. Special-token markup is always parsed;
    /// `add_special` controls the BOS prefix.
    fn tokenize(&self, model: &Self::Model, text: &str, add_special: bool, out: &mut [TokenId]) -> i32;

    /// Write the raw bytes of `token` into `out`. Pieces may end in the middle
    /// of a UTF-8 sequence.
    fn token_to_piece(&self, model: &Self::Model, token: TokenId, out: &mut [u8]) -> i32;

    /// Feed `batch` into the context, advancing its state.
    fn decode(&self, ctx: &mut Self::Context, batch: &Batch) -> Result<()>;

    /// Sample the next token from the last logits row and accept it into the chain.
    fn sample(&self, sampler: &mut Self::Sampler, ctx: &mut Self::Context) -> TokenId;

    fn is_end_of_generation(&self, model: &Self::Model, token: TokenId) -> bool;

    /// Drop every cached position from the context.
    fn clear_cache(&self, ctx: &mut Self::Context);

    fn performance_counters(&self, ctx: &Self::Context) -> PerfCounters;
}
