//! Scripted in-process runtime.
//!
//! `MockRuntime` implements [`InferenceRuntime`] without a model file or native
//! library. Text is tokenized byte by byte through [`ByteTokenizer`], replies are
//! scripted as raw byte pieces (so a multi-byte character can be split across
//! two tokens), and every failure the worker has to survive can be injected.
//!
//! Handles share their counters with the runtime, so tests can assert that no
//! model, context or sampler outlives a reload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use llama_tokenizer::{ByteTokenizer, Tokenizer, BYTE_BOS, BYTE_EOG};
use parking_lot::Mutex;

use crate::{
    Batch, ContextParams, InferenceRuntime, ModelMetadata, ModelParams, PerfCounters, Result,
    RuntimeError, SamplerChain, TokenId,
};

/// Vocabulary size reported by mock models.
pub const MOCK_N_VOCAB: i32 = 32_000;

/// What the sampler produces once the scripted pieces run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEnd {
    /// The end-of-generation token.
    EndOfGeneration,
    /// An id outside the vocabulary.
    InvalidToken,
    /// Keep cycling the script forever.
    Never,
}

/// Tunable behavior of a [`MockRuntime`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Reply pieces, one token each.
    pub reply: Vec<Vec<u8>>,
    pub end: ScriptEnd,
    /// Text parsed as the end-of-generation token when tokenizing.
    pub end_marker: String,
    /// Sleep applied to every decode call.
    pub decode_delay: Duration,
    pub reject_model: bool,
    pub fail_context: bool,
    /// Number of upcoming prompt decodes that fail.
    pub fail_prompt_decodes: usize,
    /// Fail the single-token decode after this many successful steps.
    pub fail_generation_decode_after: Option<usize>,
    pub n_ctx_train: i32,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            reply: split_reply("Hello! How can I help you today?"),
            end: ScriptEnd::EndOfGeneration,
            end_marker: "<|im_end|>".into(),
            decode_delay: Duration::ZERO,
            reject_model: false,
            fail_context: false,
            fail_prompt_decodes: 0,
            fail_generation_decode_after: None,
            n_ctx_train: 4096,
        }
    }
}

/// Split `text` into word pieces, each keeping its trailing space.
pub fn split_reply(text: &str) -> Vec<Vec<u8>> {
    text.split_inclusive(' ')
        .map(|word| word.as_bytes().to_vec())
        .collect()
}

/// One recorded `tokenize` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizeCall {
    pub text: String,
    pub add_special: bool,
    /// Size of the output buffer the caller offered.
    pub capacity: usize,
    /// Number of tokens the text needs.
    pub required: usize,
}

/// Live handle counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveHandles {
    pub models: usize,
    pub contexts: usize,
    pub samplers: usize,
}

#[derive(Debug, Default)]
struct HandleCounters {
    models: AtomicUsize,
    contexts: AtomicUsize,
    samplers: AtomicUsize,
    loads: AtomicUsize,
    /// Models dropped while a context or sampler was still alive.
    order_violations: AtomicUsize,
}

#[derive(Debug)]
struct MockState {
    config: MockConfig,
    vocab: ByteTokenizer,
    tokenize_log: Vec<TokenizeCall>,
}

/// Deterministic [`InferenceRuntime`] for tests and demos. Clones share state.
#[derive(Debug, Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    counters: Arc<HandleCounters>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Self {
        let vocab = ByteTokenizer::new(&config.end_marker);
        Self {
            state: Arc::new(Mutex::new(MockState {
                config,
                vocab,
                tokenize_log: Vec::new(),
            })),
            counters: Arc::new(HandleCounters::default()),
        }
    }

    /// Script the reply as word pieces of `text`.
    pub fn with_reply(self, text: &str) -> Self {
        self.configure(|c| c.reply = split_reply(text));
        self
    }

    /// Script the reply as raw byte pieces.
    pub fn with_pieces<I, P>(self, pieces: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let pieces: Vec<Vec<u8>> = pieces.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self.configure(|c| c.reply = pieces);
        self
    }

    pub fn with_end(self, end: ScriptEnd) -> Self {
        self.configure(|c| c.end = end);
        self
    }

    pub fn with_decode_delay(self, delay: Duration) -> Self {
        self.configure(|c| c.decode_delay = delay);
        self
    }

    /// Change behavior in place. Takes effect on the next runtime call.
    pub fn configure(&self, f: impl FnOnce(&mut MockConfig)) {
        let mut state = self.state.lock();
        let marker = state.config.end_marker.clone();
        f(&mut state.config);
        if state.config.end_marker != marker {
            state.vocab = ByteTokenizer::new(&state.config.end_marker);
        }
    }

    pub fn tokenize_calls(&self) -> Vec<TokenizeCall> {
        self.state.lock().tokenize_log.clone()
    }

    pub fn clear_tokenize_calls(&self) {
        self.state.lock().tokenize_log.clear();
    }

    pub fn live_handles(&self) -> LiveHandles {
        LiveHandles {
            models: self.counters.models.load(Ordering::SeqCst),
            contexts: self.counters.contexts.load(Ordering::SeqCst),
            samplers: self.counters.samplers.load(Ordering::SeqCst),
        }
    }

    /// Number of successful model loads.
    pub fn load_count(&self) -> usize {
        self.counters.loads.load(Ordering::SeqCst)
    }

    /// Number of models released while dependent handles were still alive.
    pub fn order_violations(&self) -> usize {
        self.counters.order_violations.load(Ordering::SeqCst)
    }

    fn encode(&self, text: &str, add_special: bool) -> Vec<TokenId> {
        let state = self.state.lock();
        let marker = state.config.end_marker.as_str();
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BYTE_BOS);
        }
        let mut segments = if marker.is_empty() {
            vec![text].into_iter()
        } else {
            text.split(marker).collect::<Vec<_>>().into_iter()
        };
        if let Some(first) = segments.next() {
            tokens.extend(state.vocab.encode(first, false));
        }
        for segment in segments {
            tokens.push(BYTE_EOG);
            tokens.extend(state.vocab.encode(segment, false));
        }
        tokens
    }
}

/// Loaded mock model.
#[derive(Debug)]
pub struct MockModel {
    path: PathBuf,
    counters: Arc<HandleCounters>,
}

impl MockModel {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MockModel {
    fn drop(&mut self) {
        if self.counters.contexts.load(Ordering::SeqCst) > 0
            || self.counters.samplers.load(Ordering::SeqCst) > 0
        {
            self.counters.order_violations.fetch_add(1, Ordering::SeqCst);
        }
        self.counters.models.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock context: tracks the cache position and which batch last produced logits.
#[derive(Debug)]
pub struct MockContext {
    n_ctx: usize,
    n_past: usize,
    logits_ready: bool,
    last_sampled: Option<TokenId>,
    /// Bumped on every prompt batch so samplers restart their script.
    epoch: u64,
    steps_since_prompt: usize,
    perf: PerfCounters,
    counters: Arc<HandleCounters>,
}

impl MockContext {
    /// Positions currently held in the cache.
    pub fn n_past(&self) -> usize {
        self.n_past
    }
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.counters.contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock sampler: a cursor into the reply script.
#[derive(Debug)]
pub struct MockSampler {
    cursor: usize,
    epoch: u64,
    counters: Arc<HandleCounters>,
}

impl Drop for MockSampler {
    fn drop(&mut self) {
        self.counters.samplers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InferenceRuntime for MockRuntime {
    type Model = MockModel;
    type Context = MockContext;
    type Sampler = MockSampler;

    fn load_model(&self, path: &Path, _params: &ModelParams) -> Result<MockModel> {
        if self.state.lock().config.reject_model {
            return Err(RuntimeError::ModelRejected(format!(
                "{} is not a valid model",
                path.display()
            )));
        }
        self.counters.models.fetch_add(1, Ordering::SeqCst);
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(MockModel {
            path: path.to_path_buf(),
            counters: Arc::clone(&self.counters),
        })
    }

    fn create_context(&self, _model: &MockModel, params: &ContextParams) -> Result<MockContext> {
        if self.state.lock().config.fail_context {
            return Err(RuntimeError::ContextCreation("injected failure".into()));
        }
        if params.n_ctx == 0 {
            return Err(RuntimeError::ContextCreation("n_ctx must be > 0".into()));
        }
        self.counters.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(MockContext {
            n_ctx: params.n_ctx as usize,
            n_past: 0,
            logits_ready: false,
            last_sampled: None,
            epoch: 0,
            steps_since_prompt: 0,
            perf: PerfCounters::default(),
            counters: Arc::clone(&self.counters),
        })
    }

    fn create_sampler(&self, _model: &MockModel, chain: &SamplerChain) -> Result<MockSampler> {
        chain
            .validate()
            .map_err(|e| RuntimeError::SamplerCreation(e.to_string()))?;
        self.counters.samplers.fetch_add(1, Ordering::SeqCst);
        Ok(MockSampler {
            cursor: 0,
            epoch: 0,
            counters: Arc::clone(&self.counters),
        })
    }

    fn model_metadata(&self, model: &MockModel) -> ModelMetadata {
        let name = model
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mock".into());
        ModelMetadata {
            description: format!("{name} (mock, byte-level)"),
            n_params: 1_000_000,
            n_layers: 4,
            n_embd: 64,
            n_ctx_train: self.state.lock().config.n_ctx_train,
            n_vocab: MOCK_N_VOCAB,
        }
    }

    fn tokenize(&self, _model: &MockModel, text: &str, add_special: bool, out: &mut [TokenId]) -> i32 {
        let tokens = self.encode(text, add_special);
        self.state.lock().tokenize_log.push(TokenizeCall {
            text: text.to_string(),
            add_special,
            capacity: out.len(),
            required: tokens.len(),
        });
        if out.len() < tokens.len() {
            return -(tokens.len() as i32);
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        tokens.len() as i32
    }

    fn token_to_piece(&self, _model: &MockModel, token: TokenId, out: &mut [u8]) -> i32 {
        let state = self.state.lock();
        let bytes = match state.vocab.piece(token) {
            Ok(bytes) => bytes,
            Err(_) => return 0,
        };
        if out.len() < bytes.len() {
            return -(bytes.len() as i32);
        }
        out[..bytes.len()].copy_from_slice(bytes);
        bytes.len() as i32
    }

    fn decode(&self, ctx: &mut MockContext, batch: &Batch) -> Result<()> {
        let started = Instant::now();
        let is_prompt = batch.len() > 1 || batch.tokens().next() != ctx.last_sampled;

        let (delay, fail) = {
            let mut state = self.state.lock();
            let fail = if is_prompt {
                if state.config.fail_prompt_decodes > 0 {
                    state.config.fail_prompt_decodes -= 1;
                    true
                } else {
                    false
                }
            } else {
                state.config.fail_generation_decode_after == Some(ctx.steps_since_prompt)
            };
            (state.config.decode_delay, fail)
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if fail {
            return Err(RuntimeError::Decode { status: -3 });
        }

        if batch.start_pos() as usize != ctx.n_past {
            return Err(RuntimeError::InvalidBatch(format!(
                "batch starts at {} but cache holds {} positions",
                batch.start_pos(),
                ctx.n_past
            )));
        }
        if batch.tokens().any(|t| !(0..MOCK_N_VOCAB).contains(&t)) {
            return Err(RuntimeError::Decode { status: -1 });
        }
        if ctx.n_past + batch.len() > ctx.n_ctx {
            return Err(RuntimeError::Decode { status: 1 });
        }

        ctx.n_past += batch.len();
        ctx.logits_ready = batch.entries().last().is_some_and(|e| e.logits);
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        if is_prompt {
            ctx.epoch += 1;
            ctx.steps_since_prompt = 0;
            ctx.perf.tokens_in += batch.len() as u64;
            ctx.perf.prompt_eval_ms += elapsed;
        } else {
            ctx.steps_since_prompt += 1;
            ctx.perf.tokens_out += 1;
            ctx.perf.eval_ms += elapsed;
        }
        ctx.last_sampled = None;
        Ok(())
    }

    fn sample(&self, sampler: &mut MockSampler, ctx: &mut MockContext) -> TokenId {
        if !ctx.logits_ready {
            return -1;
        }
        if sampler.epoch != ctx.epoch {
            sampler.epoch = ctx.epoch;
            sampler.cursor = 0;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let reply = &state.config.reply;
        let token = match reply.get(sampler.cursor) {
            Some(piece) => state.vocab.add_piece(piece),
            None => match state.config.end {
                ScriptEnd::EndOfGeneration => BYTE_EOG,
                ScriptEnd::InvalidToken => MOCK_N_VOCAB + 1,
                ScriptEnd::Never if reply.is_empty() => i32::from(b'.'),
                ScriptEnd::Never => state.vocab.add_piece(&reply[sampler.cursor % reply.len()]),
            },
        };
        sampler.cursor += 1;
        ctx.last_sampled = Some(token);
        token
    }

    fn is_end_of_generation(&self, _model: &MockModel, token: TokenId) -> bool {
        self.state.lock().vocab.is_eog(token)
    }

    fn clear_cache(&self, ctx: &mut MockContext) {
        ctx.n_past = 0;
        ctx.logits_ready = false;
        ctx.last_sampled = None;
    }

    fn performance_counters(&self, ctx: &MockContext) -> PerfCounters {
        ctx.perf
    }
}
