//! llama.cpp binding.
//!
//! [`LlamaCppRuntime`] implements [`InferenceRuntime`] over the raw C API from
//! `llama-cpp-sys-2`. Every native object lives in an owning wrapper whose
//! `Drop` releases it exactly once:
//!
//! | wrapper | released by |
//! |---|---|
//! | [`LlamaCppModel`] | `llama_model_free` |
//! | [`LlamaCppContext`] | `llama_free` |
//! | [`LlamaCppSampler`] | `llama_sampler_free` |
//! | `NativeBatch` | `llama_batch_free` |
//!
//! # Safety
//!
//! The wrappers are `Send` but not `Sync`: llama.cpp mutates context and
//! sampler state on every call, so a handle must only be used from one thread
//! at a time. A context keeps a raw pointer into its model; the owner must drop
//! contexts and samplers before the model.

use std::ffi::{c_char, CString};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Once;

use llama_cpp_sys_2 as sys;
use llama_engine::{
    Batch, ContextParams, InferenceRuntime, ModelMetadata, ModelParams, PerfCounters, Result,
    RuntimeError, SamplerChain, SamplerStage, TokenId,
};

static BACKEND_INIT: Once = Once::new();

/// Runtime over the process-wide llama.cpp backend.
#[derive(Debug, Clone, Copy)]
pub struct LlamaCppRuntime {
    _private: (),
}

impl Default for LlamaCppRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LlamaCppRuntime {
    /// Initialize the backend (once per process).
    pub fn new() -> Self {
        BACKEND_INIT.call_once(|| unsafe { sys::llama_backend_init() });
        Self { _private: () }
    }
}

/// Owned `llama_model`.
#[derive(Debug)]
pub struct LlamaCppModel {
    ptr: NonNull<sys::llama_model>,
}

// SAFETY: a model is immutable after load; it is only freed by its owner.
unsafe impl Send for LlamaCppModel {}

impl LlamaCppModel {
    fn vocab(&self) -> *const sys::llama_vocab {
        unsafe { sys::llama_model_get_vocab(self.ptr.as_ptr()) }
    }
}

impl Drop for LlamaCppModel {
    fn drop(&mut self) {
        unsafe { sys::llama_model_free(self.ptr.as_ptr()) }
    }
}

/// Owned `llama_context`.
#[derive(Debug)]
pub struct LlamaCppContext {
    ptr: NonNull<sys::llama_context>,
}

// SAFETY: moved between threads but never shared; see module docs.
unsafe impl Send for LlamaCppContext {}

impl Drop for LlamaCppContext {
    fn drop(&mut self) {
        unsafe { sys::llama_free(self.ptr.as_ptr()) }
    }
}

/// Owned sampler chain.
#[derive(Debug)]
pub struct LlamaCppSampler {
    ptr: NonNull<sys::llama_sampler>,
}

// SAFETY: as for the context.
unsafe impl Send for LlamaCppSampler {}

impl Drop for LlamaCppSampler {
    fn drop(&mut self) {
        unsafe { sys::llama_sampler_free(self.ptr.as_ptr()) }
    }
}

/// Native batch, freed on every exit path.
struct NativeBatch {
    raw: sys::llama_batch,
}

impl NativeBatch {
    /// Allocate a native batch and copy `batch` into it, all entries in sequence 0.
    fn fill(batch: &Batch) -> Self {
        let n = batch.len() as i32;
        let mut native = Self {
            raw: unsafe { sys::llama_batch_init(n, 0, 1) },
        };
        for (i, entry) in batch.entries().iter().enumerate() {
            // SAFETY: llama_batch_init allocated `n` slots for every array and
            // one sequence id per slot.
            unsafe {
                *native.raw.token.add(i) = entry.token;
                *native.raw.pos.add(i) = entry.pos;
                *native.raw.n_seq_id.add(i) = 1;
                *(*native.raw.seq_id.add(i)) = 0;
                *native.raw.logits.add(i) = i8::from(entry.logits);
            }
        }
        native.raw.n_tokens = n;
        native
    }
}

impl Drop for NativeBatch {
    fn drop(&mut self) {
        unsafe { sys::llama_batch_free(self.raw) }
    }
}

fn add_stage(chain: NonNull<sys::llama_sampler>, stage: &SamplerStage) -> Result<()> {
    let raw = unsafe {
        match *stage {
            SamplerStage::Temperature { t } => sys::llama_sampler_init_temp(t),
            SamplerStage::TopK { k } => sys::llama_sampler_init_top_k(k),
            SamplerStage::TopP { p, min_keep } => sys::llama_sampler_init_top_p(p, min_keep),
            SamplerStage::MinP { p, min_keep } => sys::llama_sampler_init_min_p(p, min_keep),
            SamplerStage::RepetitionPenalty { last_n, penalty } => {
                sys::llama_sampler_init_penalties(last_n, penalty, 0.0, 0.0)
            }
            SamplerStage::Greedy => sys::llama_sampler_init_greedy(),
            SamplerStage::Distribution { seed } => sys::llama_sampler_init_dist(seed),
        }
    };
    if raw.is_null() {
        return Err(RuntimeError::SamplerCreation(format!(
            "llama.cpp returned no sampler for {stage:?}"
        )));
    }
    // The chain takes ownership of the stage.
    unsafe { sys::llama_sampler_chain_add(chain.as_ptr(), raw) };
    Ok(())
}

impl InferenceRuntime for LlamaCppRuntime {
    type Model = LlamaCppModel;
    type Context = LlamaCppContext;
    type Sampler = LlamaCppSampler;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<LlamaCppModel> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| RuntimeError::ModelRejected("path contains a NUL byte".into()))?;
        let mut native = unsafe { sys::llama_model_default_params() };
        native.n_gpu_layers = params.n_gpu_layers as i32;
        native.use_mmap = params.use_mmap;

        let ptr = unsafe { sys::llama_model_load_from_file(c_path.as_ptr(), native) };
        NonNull::new(ptr)
            .map(|ptr| LlamaCppModel { ptr })
            .ok_or_else(|| {
                RuntimeError::ModelRejected(format!("llama.cpp could not load {}", path.display()))
            })
    }

    fn create_context(&self, model: &LlamaCppModel, params: &ContextParams) -> Result<LlamaCppContext> {
        let mut native = unsafe { sys::llama_context_default_params() };
        native.n_ctx = params.n_ctx;
        native.n_batch = params.n_batch;
        native.n_threads = params.n_threads;
        native.n_threads_batch = params.n_threads;

        let ptr = unsafe { sys::llama_init_from_model(model.ptr.as_ptr(), native) };
        NonNull::new(ptr)
            .map(|ptr| LlamaCppContext { ptr })
            .ok_or_else(|| {
                RuntimeError::ContextCreation(format!("n_ctx={} n_batch={}", params.n_ctx, params.n_batch))
            })
    }

    fn create_sampler(&self, _model: &LlamaCppModel, chain: &SamplerChain) -> Result<LlamaCppSampler> {
        chain
            .validate()
            .map_err(|e| RuntimeError::SamplerCreation(e.to_string()))?;
        let params = unsafe { sys::llama_sampler_chain_default_params() };
        let ptr = NonNull::new(unsafe { sys::llama_sampler_chain_init(params) })
            .ok_or_else(|| RuntimeError::SamplerCreation("chain allocation failed".into()))?;
        // From here on the wrapper frees the chain and every stage already added.
        let sampler = LlamaCppSampler { ptr };
        for stage in chain.stages() {
            add_stage(sampler.ptr, stage)?;
        }
        Ok(sampler)
    }

    fn model_metadata(&self, model: &LlamaCppModel) -> ModelMetadata {
        let mut buf = vec![0u8; 256];
        let n = unsafe {
            sys::llama_model_desc(model.ptr.as_ptr(), buf.as_mut_ptr() as *mut c_char, buf.len())
        };
        buf.truncate(n.clamp(0, 255) as usize);
        let ptr = model.ptr.as_ptr();
        unsafe {
            ModelMetadata {
                description: String::from_utf8_lossy(&buf).into_owned(),
                n_params: sys::llama_model_n_params(ptr),
                n_layers: sys::llama_model_n_layer(ptr),
                n_embd: sys::llama_model_n_embd(ptr),
                n_ctx_train: sys::llama_model_n_ctx_train(ptr),
                n_vocab: sys::llama_vocab_n_tokens(model.vocab()),
            }
        }
    }

    fn tokenize(&self, model: &LlamaCppModel, text: &str, add_special: bool, out: &mut [TokenId]) -> i32 {
        unsafe {
            sys::llama_tokenize(
                model.vocab(),
                text.as_ptr() as *const c_char,
                text.len() as i32,
                out.as_mut_ptr(),
                out.len() as i32,
                add_special,
                true,
            )
        }
    }

    fn token_to_piece(&self, model: &LlamaCppModel, token: TokenId, out: &mut [u8]) -> i32 {
        unsafe {
            sys::llama_token_to_piece(
                model.vocab(),
                token,
                out.as_mut_ptr() as *mut c_char,
                out.len() as i32,
                0,
                false,
            )
        }
    }

    fn decode(&self, ctx: &mut LlamaCppContext, batch: &Batch) -> Result<()> {
        let native = NativeBatch::fill(batch);
        let status = unsafe { sys::llama_decode(ctx.ptr.as_ptr(), native.raw) };
        if status != 0 {
            return Err(RuntimeError::Decode { status });
        }
        Ok(())
    }

    fn sample(&self, sampler: &mut LlamaCppSampler, ctx: &mut LlamaCppContext) -> TokenId {
        // -1 selects the last logits row; llama_sampler_sample also accepts the token.
        unsafe { sys::llama_sampler_sample(sampler.ptr.as_ptr(), ctx.ptr.as_ptr(), -1) }
    }

    fn is_end_of_generation(&self, model: &LlamaCppModel, token: TokenId) -> bool {
        unsafe { sys::llama_vocab_is_eog(model.vocab(), token) }
    }

    fn clear_cache(&self, ctx: &mut LlamaCppContext) {
        unsafe {
            let memory = sys::llama_get_memory(ctx.ptr.as_ptr());
            sys::llama_memory_clear(memory, true);
        }
    }

    fn performance_counters(&self, ctx: &LlamaCppContext) -> PerfCounters {
        let data = unsafe { sys::llama_perf_context(ctx.ptr.as_ptr()) };
        PerfCounters {
            tokens_in: data.n_p_eval.max(0) as u64,
            tokens_out: data.n_eval.max(0) as u64,
            prompt_eval_ms: data.t_p_eval_ms,
            eval_ms: data.t_eval_ms,
        }
    }
}
