//! Generation worker.
//!
//! [`GenerationWorker`] is the only code that calls into an
//! [`InferenceRuntime`]. It owns the model, context and sampler handles together
//! with the [`SessionState`] that records what the context has seen, and turns
//! a [`GenerationRequest`] into an ordered stream of [`StreamEvent`]s:
//!
//! - **Prompt**: the turn text is wrapped in ChatML, tokenized and decoded as
//!   one or more batches starting at the session's cache position.
//! - **Loop**: sample, convert to text, decode the sampled token, repeat until
//!   end-of-generation, the token bound, the context bound or a stop request.
//!
//! Later turns only send the new user text, so multi-turn conversations are
//! incremental rather than quadratic in history length.
//!
//! The worker is single-threaded; [`actor`] runs it on a dedicated thread.

pub mod actor;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use llama_engine::{Batch, InferenceRuntime, ModelMetadata, PerfCounters, RuntimeError, TokenId};
use llama_kv::{KvError, SessionState};
use llama_runtime::{InferenceTimer, WorkerActivity};
use llama_tokenizer::DecodingState;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, GenerationConfig};
use crate::error::{GenerateError, LoadError};

/// One user turn submitted for generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub prompt: String,
    /// 0 for the first turn of a conversation.
    pub turn_index: usize,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, turn_index: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            turn_index,
        }
    }
}

/// Events of one request, in order: `Started`, zero or more `TokenFragment`,
/// then exactly one of `Finished`, `Stopped` or `Error`.
///
/// A request that fails before its prompt is decoded emits only `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Started {
        request_id: Uuid,
        prompt_tokens: usize,
    },
    TokenFragment(String),
    Finished {
        response: String,
        token_count: usize,
        prompt_tokens: usize,
        duration_ms: f64,
    },
    Stopped {
        response: String,
        token_count: usize,
        prompt_tokens: usize,
        duration_ms: f64,
    },
    Error(String),
}

impl StreamEvent {
    /// Whether this event ends its request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Finished { .. } | StreamEvent::Stopped { .. } | StreamEvent::Error(_)
        )
    }
}

/// Worker lifecycle: `Idle -> Loading -> Ready -> Generating -> {Ready, Error}`,
/// and back to `Idle` on unload or a failed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Loading = 1,
    Ready = 2,
    Generating = 3,
    /// The last request failed; the model is still loaded.
    Error = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Loading,
            2 => WorkerState::Ready,
            3 => WorkerState::Generating,
            4 => WorkerState::Error,
            _ => WorkerState::Idle,
        }
    }

    /// Whether a model is loaded in this state.
    pub fn has_model(self) -> bool {
        matches!(
            self,
            WorkerState::Ready | WorkerState::Generating | WorkerState::Error
        )
    }
}

impl From<WorkerState> for WorkerActivity {
    fn from(state: WorkerState) -> Self {
        match state {
            WorkerState::Idle => WorkerActivity::Idle,
            WorkerState::Loading => WorkerActivity::Loading,
            WorkerState::Ready => WorkerActivity::Ready,
            WorkerState::Generating => WorkerActivity::Generating,
            WorkerState::Error => WorkerActivity::Error,
        }
    }
}

/// The only state shared between the worker thread and its callers.
#[derive(Debug)]
pub struct WorkerSignals {
    state: AtomicU8,
    generating: AtomicBool,
    stop: AtomicBool,
}

impl Default for WorkerSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSignals {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Idle as u8),
            generating: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }

    /// Claim the right to run one request. Clears a stale stop flag.
    ///
    /// Returns `false` if a request is already in flight.
    pub fn try_claim(&self) -> bool {
        let claimed = self
            .generating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.stop.store(false, Ordering::Release);
        }
        claimed
    }

    /// Give the claim back.
    pub fn release(&self) {
        self.generating.store(false, Ordering::Release);
    }

    /// Ask the in-flight request to stop. No-op when nothing is generating.
    ///
    /// Returns whether a stop was requested.
    pub fn request_stop(&self) -> bool {
        if self.is_generating() {
            self.stop.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }
}

/// Quantization type guessed from a model file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantization {
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    F16,
    F32,
    Unknown,
}

impl Quantization {
    pub fn from_file_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        [
            ("Q4_0", Quantization::Q4_0),
            ("Q4_1", Quantization::Q4_1),
            ("Q5_0", Quantization::Q5_0),
            ("Q5_1", Quantization::Q5_1),
            ("Q8_0", Quantization::Q8_0),
            ("F16", Quantization::F16),
            ("F32", Quantization::F32),
        ]
        .into_iter()
        .find(|(tag, _)| upper.contains(tag))
        .map_or(Quantization::Unknown, |(_, q)| q)
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantization::Q4_0 => "Q4_0",
            Quantization::Q4_1 => "Q4_1",
            Quantization::Q5_0 => "Q5_0",
            Quantization::Q5_1 => "Q5_1",
            Quantization::Q8_0 => "Q8_0",
            Quantization::F16 => "F16",
            Quantization::F32 => "F32",
            Quantization::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// `7_241_732_096` -> `"7.2B"`.
pub fn human_param_count(n: u64) -> String {
    let n_f = n as f64;
    if n >= 1_000_000_000 {
        format!("{:.1}B", n_f / 1e9)
    } else if n >= 1_000_000 {
        format!("{:.1}M", n_f / 1e6)
    } else if n >= 1_000 {
        format!("{:.1}K", n_f / 1e3)
    } else {
        n.to_string()
    }
}

/// Facts about the loaded model and the context built for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub file_name: String,
    pub path: PathBuf,
    pub file_size: u64,
    pub quantization: Quantization,
    pub description: String,
    pub n_params: u64,
    pub params_human: String,
    pub n_layers: i32,
    pub n_embd: i32,
    pub n_ctx_train: i32,
    pub n_vocab: i32,
    pub n_ctx: u32,
    pub n_threads: i32,
    pub loaded_at: DateTime<Utc>,
}

impl ModelSummary {
    fn new(path: &Path, file_size: u64, meta: &ModelMetadata, config: &EngineConfig) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            quantization: Quantization::from_file_name(&file_name),
            file_name,
            path: path.to_path_buf(),
            file_size,
            description: meta.description.clone(),
            n_params: meta.n_params,
            params_human: human_param_count(meta.n_params),
            n_layers: meta.n_layers,
            n_embd: meta.n_embd,
            n_ctx_train: meta.n_ctx_train,
            n_vocab: meta.n_vocab,
            n_ctx: config.context.n_ctx,
            n_threads: config.context.n_threads,
            loaded_at: Utc::now(),
        }
    }
}

/// Handles of one loaded model. Fields drop in declaration order, so the
/// sampler and context are released before the model they point into.
struct LoadedModel<R: InferenceRuntime> {
    sampler: R::Sampler,
    context: R::Context,
    model: R::Model,
    n_vocab: i32,
    summary: ModelSummary,
}

/// Prompt text for one turn.
///
/// The first turn carries the system preamble. Later turns start by closing
/// the previous assistant turn, whose end-of-generation token was sampled but
/// never decoded into the context.
pub fn build_turn_prompt(config: &GenerationConfig, text: &str, first_turn: bool) -> String {
    let end = &config.end_marker;
    if first_turn {
        format!(
            "<|im_start|>system\n{}{end}\n<|im_start|>user\n{text}{end}\n<|im_start|>assistant\n",
            config.system_prompt
        )
    } else {
        format!("{end}\n<|im_start|>user\n{text}{end}\n<|im_start|>assistant\n")
    }
}

/// Tokenize with a heuristic buffer, growing it once to the size the runtime asks for.
fn tokenize<R: InferenceRuntime>(
    runtime: &R,
    model: &R::Model,
    text: &str,
    add_special: bool,
) -> Result<Vec<TokenId>, GenerateError> {
    let mut tokens = vec![0; text.len() / 2 + 16];
    let mut n = runtime.tokenize(model, text, add_special, &mut tokens);
    if n < 0 {
        tokens.resize(n.unsigned_abs() as usize, 0);
        n = runtime.tokenize(model, text, add_special, &mut tokens);
    }
    if n <= 0 {
        return Err(GenerateError::Tokenize(format!(
            "runtime returned {n} for {} bytes of text",
            text.len()
        )));
    }
    tokens.truncate(n as usize);
    Ok(tokens)
}

/// Raw bytes of `token`, reusing `buf`.
fn token_piece<'b, R: InferenceRuntime>(
    runtime: &R,
    model: &R::Model,
    token: TokenId,
    buf: &'b mut Vec<u8>,
) -> &'b [u8] {
    let mut n = runtime.token_to_piece(model, token, buf);
    if n < 0 {
        buf.resize(n.unsigned_abs() as usize, 0);
        n = runtime.token_to_piece(model, token, buf);
    }
    let len = (n.max(0) as usize).min(buf.len());
    &buf[..len]
}

fn strip_marker(text: &str, marker: &str) -> String {
    if marker.is_empty() {
        text.to_string()
    } else {
        text.replace(marker, "")
    }
}

/// How the generation loop ended.
enum LoopEnd {
    Finished,
    Stopped,
}

/// Owns the runtime handles and runs requests one at a time.
pub struct GenerationWorker<R: InferenceRuntime> {
    runtime: R,
    loaded: Option<LoadedModel<R>>,
    session: SessionState,
    config: EngineConfig,
    signals: Arc<WorkerSignals>,
    on_state: Box<dyn FnMut(WorkerState) + Send>,
}

impl<R: InferenceRuntime> GenerationWorker<R> {
    pub fn new(runtime: R, config: EngineConfig, signals: Arc<WorkerSignals>) -> Self {
        Self {
            runtime,
            loaded: None,
            session: SessionState::new(config.context.n_ctx as usize),
            config,
            signals,
            on_state: Box::new(|_| {}),
        }
    }

    /// Install a callback fired on every state transition.
    pub fn with_state_observer(mut self, observer: impl FnMut(WorkerState) + Send + 'static) -> Self {
        self.on_state = Box::new(observer);
        self
    }

    pub fn signals(&self) -> &Arc<WorkerSignals> {
        &self.signals
    }

    pub fn state(&self) -> WorkerState {
        self.signals.state()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn summary(&self) -> Option<&ModelSummary> {
        self.loaded.as_ref().map(|l| &l.summary)
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Counters of the current context, if a model is loaded.
    pub fn performance_counters(&self) -> Option<PerfCounters> {
        self.loaded
            .as_ref()
            .map(|l| self.runtime.performance_counters(&l.context))
    }

    fn transition(&mut self, state: WorkerState) {
        if self.signals.state() != state {
            debug!(from = ?self.signals.state(), to = ?state, "worker state");
        }
        self.signals.set_state(state);
        (self.on_state)(state);
    }

    /// Replace the loaded model with the one at `path`.
    ///
    /// Previous handles are released before anything new is created. On error
    /// the worker is left with no model.
    pub fn load_model(&mut self, path: &Path) -> Result<ModelSummary, LoadError> {
        self.transition(WorkerState::Loading);
        self.release();

        match self.build(path) {
            Ok(loaded) => {
                let summary = loaded.summary.clone();
                info!(
                    model = %summary.file_name,
                    params = %summary.params_human,
                    quantization = %summary.quantization,
                    n_ctx = summary.n_ctx,
                    "model loaded"
                );
                self.session = SessionState::new(self.config.context.n_ctx as usize);
                self.loaded = Some(loaded);
                self.transition(WorkerState::Ready);
                Ok(summary)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "model load failed");
                self.transition(WorkerState::Idle);
                Err(e)
            }
        }
    }

    fn build(&self, path: &Path) -> Result<LoadedModel<R>, LoadError> {
        let file = std::fs::metadata(path).map_err(|_| LoadError::NotFound(path.to_path_buf()))?;
        if !file.is_file() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        let model = self
            .runtime
            .load_model(path, &self.config.model)
            .map_err(|e| LoadError::ModelRejected(e.to_string()))?;
        let context = self
            .runtime
            .create_context(&model, &self.config.context)
            .map_err(|e| LoadError::ContextCreationFailed(e.to_string()))?;
        let sampler = self
            .runtime
            .create_sampler(&model, &self.config.sampling)
            .map_err(|e| LoadError::InvalidSampler(e.to_string()))?;

        let meta = self.runtime.model_metadata(&model);
        Ok(LoadedModel {
            sampler,
            context,
            n_vocab: meta.n_vocab,
            summary: ModelSummary::new(path, file.len(), &meta, &self.config),
            model,
        })
    }

    fn release(&mut self) {
        if let Some(loaded) = self.loaded.take() {
            info!(model = %loaded.summary.file_name, "releasing model");
        }
        self.session.reset();
    }

    /// Tear down every handle and forget the conversation.
    pub fn unload(&mut self) {
        self.release();
        self.transition(WorkerState::Idle);
    }

    /// Drop the conversation while keeping the model.
    pub fn clear_context(&mut self) -> Result<(), GenerateError> {
        let loaded = self.loaded.as_mut().ok_or(GenerateError::NotLoaded)?;
        self.runtime.clear_cache(&mut loaded.context);
        self.session.reset();
        debug!("context cleared");
        Ok(())
    }

    /// Run `request`, passing every event to `emit`.
    ///
    /// Returns the terminal event (`Finished` or `Stopped`) or the error that
    /// was reported as `Error`. When another request is in flight nothing is
    /// emitted and `Busy` is returned.
    pub fn generate<F>(&mut self, request: &GenerationRequest, emit: F) -> Result<StreamEvent, GenerateError>
    where
        F: FnMut(StreamEvent),
    {
        if !self.signals.try_claim() {
            return Err(GenerateError::Busy);
        }
        self.generate_claimed(request, emit)
    }

    /// [`generate`](Self::generate) for a caller that already holds the claim.
    pub(crate) fn generate_claimed<F>(
        &mut self,
        request: &GenerationRequest,
        mut emit: F,
    ) -> Result<StreamEvent, GenerateError>
    where
        F: FnMut(StreamEvent),
    {
        debug!(request = %request.id, turn = request.turn_index, "request started");
        let idle_state = self.signals.state();
        if self.loaded.is_some() {
            self.transition(WorkerState::Generating);
        }

        let result = self.run(request, &mut emit);

        let next = match (&result, self.loaded.is_some()) {
            (_, false) => idle_state,
            (Ok(_), true) => WorkerState::Ready,
            (Err(_), true) => WorkerState::Error,
        };
        self.transition(next);
        self.signals.clear_stop();
        self.signals.release();

        match &result {
            Ok(event) => {
                debug!(request = %request.id, "request complete");
                emit(event.clone());
            }
            Err(e) => {
                warn!(request = %request.id, error = %e, "request failed");
                emit(StreamEvent::Error(e.to_string()));
            }
        }
        result
    }

    fn run(
        &mut self,
        request: &GenerationRequest,
        emit: &mut dyn FnMut(StreamEvent),
    ) -> Result<StreamEvent, GenerateError> {
        let Self {
            runtime,
            loaded,
            session,
            config,
            signals,
            ..
        } = self;
        let loaded = loaded.as_mut().ok_or(GenerateError::NotLoaded)?;
        let opts = &config.generation;
        let mut timer = InferenceTimer::start();

        let first_turn = request.turn_index == 0 || session.is_empty();
        if request.turn_index > 0 && session.is_empty() {
            debug!(turn = request.turn_index, "empty session, sending full preamble");
        }
        let prompt = build_turn_prompt(opts, &request.prompt, first_turn);
        let tokens = tokenize(runtime, &loaded.model, &prompt, first_turn)?;

        let start = session.stage(&tokens).map_err(|e| match e {
            KvError::CapacityExceeded { needed, capacity } => {
                GenerateError::ContextOverflow { needed, capacity }
            }
            other => GenerateError::Decode(other.to_string()),
        })?;
        let n_batch = (config.context.n_batch as usize).max(1);
        for (i, chunk) in tokens.chunks(n_batch).enumerate() {
            let chunk_start = start + i * n_batch;
            let last_chunk = chunk_start + chunk.len() == start + tokens.len();
            let decoded = build_chunk(chunk, chunk_start, last_chunk)
                .and_then(|batch| runtime.decode(&mut loaded.context, &batch));
            if let Err(e) = decoded {
                session.rollback();
                if i > 0 {
                    // earlier chunks are already in the cache
                    warn!("prompt decode failed after {i} batches, resetting conversation");
                    runtime.clear_cache(&mut loaded.context);
                    session.reset();
                }
                return Err(GenerateError::Decode(e.to_string()));
            }
        }
        session.commit();
        timer.mark_prefill_complete(tokens.len());
        emit(StreamEvent::Started {
            request_id: request.id,
            prompt_tokens: tokens.len(),
        });

        let max_tokens = opts.max_new_tokens.min(session.remaining());
        let mut decoder = DecodingState::new();
        let mut piece_buf = vec![0u8; 64];
        let mut fragments = FragmentBuffer::new(&opts.end_marker, opts.fragment_batch);

        let end = loop {
            if signals.stop_requested() {
                break LoopEnd::Stopped;
            }
            if timer.token_count() >= max_tokens {
                break LoopEnd::Finished;
            }
            let token = runtime.sample(&mut loaded.sampler, &mut loaded.context);
            if token < 0 || token >= loaded.n_vocab {
                debug!(token, "invalid token, ending turn");
                break LoopEnd::Finished;
            }
            if runtime.is_end_of_generation(&loaded.model, token) {
                break LoopEnd::Finished;
            }

            let text = decoder.push_bytes(token_piece(runtime, &loaded.model, token, &mut piece_buf));
            timer.mark_token();
            fragments.push(&text, emit);

            let pos = match session.stage(&[token]) {
                Ok(pos) => pos,
                Err(e) => {
                    warn!(error = %e, "no room for generated token");
                    break LoopEnd::Finished;
                }
            };
            if let Err(e) = runtime.decode(&mut loaded.context, &Batch::single(token, pos)) {
                session.rollback();
                warn!(error = %e, generated = timer.token_count(), "decode failed mid-generation, finishing early");
                break LoopEnd::Finished;
            }
            session.commit();
        };

        let mut response = fragments.finish(&decoder.finish(), emit).trim().to_string();
        // a stop keeps whatever partial text exists, even none
        if response.is_empty() && matches!(end, LoopEnd::Finished) {
            response = opts.empty_response.clone();
        }
        let metrics = timer.finish();
        debug!(
            tokens = metrics.generated_tokens,
            ttft_ms = metrics.ttft_ms,
            tok_per_s = metrics.tokens_per_sec,
            "generation loop done"
        );

        let (response, token_count, prompt_tokens, duration_ms) = (
            response,
            metrics.generated_tokens,
            metrics.prompt_tokens,
            metrics.total_time_ms,
        );
        Ok(match end {
            LoopEnd::Finished => StreamEvent::Finished {
                response,
                token_count,
                prompt_tokens,
                duration_ms,
            },
            LoopEnd::Stopped => StreamEvent::Stopped {
                response,
                token_count,
                prompt_tokens,
                duration_ms,
            },
        })
    }
}

fn build_chunk(tokens: &[TokenId], start: usize, last: bool) -> Result<Batch, RuntimeError> {
    if last {
        return Batch::prompt(tokens, start);
    }
    let mut builder = Batch::builder(tokens.len());
    for (i, &token) in tokens.iter().enumerate() {
        builder.push(token, (start + i) as i32, false)?;
    }
    builder.build()
}

/// Groups decoded pieces into [`StreamEvent::TokenFragment`]s with end
/// markers removed.
///
/// A chunk ending in the first bytes of the marker keeps that tail back until
/// a later flush shows whether the marker completes. The concatenated
/// fragments always equal the final response.
struct FragmentBuffer<'a> {
    marker: &'a str,
    batch: usize,
    pending: String,
    pieces: usize,
    response: String,
}

impl<'a> FragmentBuffer<'a> {
    fn new(marker: &'a str, batch: usize) -> Self {
        Self {
            marker,
            batch: batch.max(1),
            pending: String::new(),
            pieces: 0,
            response: String::new(),
        }
    }

    fn push(&mut self, text: &str, emit: &mut dyn FnMut(StreamEvent)) {
        self.pending.push_str(text);
        self.pieces += 1;
        if self.pieces >= self.batch {
            self.flush(false, emit);
            self.pieces = 0;
        }
    }

    /// Flush everything including `tail` and any held marker prefix.
    fn finish(mut self, tail: &str, emit: &mut dyn FnMut(StreamEvent)) -> String {
        self.pending.push_str(tail);
        self.flush(true, emit);
        self.response
    }

    fn flush(&mut self, last: bool, emit: &mut dyn FnMut(StreamEvent)) {
        let mut text = strip_marker(&self.pending, self.marker);
        let held = if last {
            0
        } else {
            partial_marker_len(&text, self.marker)
        };
        self.pending = text.split_off(text.len() - held);
        if !text.is_empty() {
            self.response.push_str(&text);
            emit(StreamEvent::TokenFragment(text));
        }
    }
}

/// Length of the longest proper prefix of `marker` that `text` ends with.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .filter(|&k| marker.is_char_boundary(k))
        .find(|&k| text.ends_with(&marker[..k]))
        .unwrap_or(0)
}

impl<R: InferenceRuntime> Drop for GenerationWorker<R> {
    fn drop(&mut self) {
        self.release();
    }
}
