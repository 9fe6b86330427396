//! Telemetry for inference sessions.
//!
//! Provides:
//! - [`InferenceTimer`]: time to first token and wall time of one request
//! - [`TelemetryAggregator`]: rolling [`RuntimeStatus`] plus a bounded sample log
//! - [`TelemetryHook`] trait: callback interface for real-time reporting
//! - [`NoopTelemetry`] / [`LogTelemetry`]: built-in hook implementations
//!
//! The aggregator is purely observational: nothing it computes feeds back into
//! generation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use llama_engine::PerfCounters;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Aggregate metrics from one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceMetrics {
    /// Time to first token in milliseconds (prompt decode latency).
    pub ttft_ms: f64,
    /// Tokens generated per second (excludes prompt decode).
    pub tokens_per_sec: f64,
    /// Number of prompt tokens decoded for this turn.
    pub prompt_tokens: usize,
    /// Number of tokens generated.
    pub generated_tokens: usize,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
}

/// Records timestamps during one request to compute [`InferenceMetrics`].
///
/// Usage:
/// 1. Call [`InferenceTimer::start`] when the request is picked up
/// 2. Call [`mark_prefill_complete`] once the prompt batch is decoded
/// 3. Call [`mark_token`] for each generated token
/// 4. Call [`finish`] to compute final metrics
///
/// [`mark_prefill_complete`]: InferenceTimer::mark_prefill_complete
/// [`mark_token`]: InferenceTimer::mark_token
/// [`finish`]: InferenceTimer::finish
#[derive(Debug, Clone)]
pub struct InferenceTimer {
    start: Instant,
    prefill_end: Option<Instant>,
    prompt_tokens: usize,
    token_count: usize,
}

impl InferenceTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            prefill_end: None,
            prompt_tokens: 0,
            token_count: 0,
        }
    }

    /// Mark the prompt batch of `prompt_tokens` tokens as decoded.
    pub fn mark_prefill_complete(&mut self, prompt_tokens: usize) {
        self.prefill_end = Some(Instant::now());
        self.prompt_tokens = prompt_tokens;
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Wall time since [`InferenceTimer::start`] in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn finish(&self) -> InferenceMetrics {
        let total_time_ms = self.elapsed_ms();

        let ttft_ms = self
            .prefill_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        let tokens_per_sec = if decode_time_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        InferenceMetrics {
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
        }
    }
}

/// One entry of the telemetry log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tokens_per_second: f64,
    pub duration_ms: f64,
}

/// What the worker is doing, as last reported by the worker itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerActivity {
    #[default]
    Idle,
    Loading,
    Ready,
    Generating,
    Error,
}

/// Rolling "current status" view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub activity: WorkerActivity,
    /// Prompt tokens evaluated by the current context.
    pub tokens_in: u64,
    /// Generated tokens evaluated by the current context.
    pub tokens_out: u64,
    /// Single-token eval rate reported by the runtime.
    pub eval_tokens_per_second: f64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Callback trait for telemetry consumers.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called after a sample is appended to the log.
    fn on_sample(&self, _sample: &TelemetrySample) {}

    /// Called whenever the status changes.
    fn on_status(&self, _status: &RuntimeStatus) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Logs samples through `tracing` and keeps the last one for inspection.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_sample: Arc<Mutex<Option<TelemetrySample>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sample(&self) -> Option<TelemetrySample> {
        self.last_sample.lock().clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_sample(&self, sample: &TelemetrySample) {
        tracing::info!(
            tokens_in = sample.tokens_in,
            tokens_out = sample.tokens_out,
            tok_per_s = format_args!("{:.2}", sample.tokens_per_second),
            duration_ms = format_args!("{:.1}", sample.duration_ms),
            "generation sample"
        );
        *self.last_sample.lock() = Some(sample.clone());
    }

    fn on_status(&self, status: &RuntimeStatus) {
        tracing::debug!(activity = ?status.activity, tokens_out = status.tokens_out, "runtime status");
    }
}

/// Derives rates from worker outputs and keeps a bounded history.
///
/// # Invariants
/// - `history().len() <= capacity()`
/// - samples are ordered oldest → newest; the oldest is evicted first
pub struct TelemetryAggregator {
    history: VecDeque<TelemetrySample>,
    capacity: usize,
    status: RuntimeStatus,
    hook: Box<dyn TelemetryHook>,
}

impl std::fmt::Debug for TelemetryAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryAggregator")
            .field("len", &self.history.len())
            .field("capacity", &self.capacity)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl TelemetryAggregator {
    /// Aggregator keeping at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self::with_hook(capacity, Box::new(NoopTelemetry))
    }

    pub fn with_hook(capacity: usize, hook: Box<dyn TelemetryHook>) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            status: RuntimeStatus::default(),
            hook,
        }
    }

    /// Record a finished or stopped request.
    ///
    /// Returns `None` without recording when either `token_count` or
    /// `duration_ms` is not positive.
    pub fn record(
        &mut self,
        token_count: usize,
        duration_ms: f64,
        tokens_in: usize,
    ) -> Option<TelemetrySample> {
        if token_count == 0 || !(duration_ms > 0.0) {
            return None;
        }
        let sample = TelemetrySample {
            timestamp: Utc::now(),
            tokens_in: tokens_in as u64,
            tokens_out: token_count as u64,
            tokens_per_second: token_count as f64 * 1000.0 / duration_ms,
            duration_ms,
        };
        while self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample.clone());
        self.hook.on_sample(&sample);
        Some(sample)
    }

    /// Fold the runtime's raw counters into the status.
    pub fn observe_counters(&mut self, counters: PerfCounters) {
        self.status.tokens_in = counters.tokens_in;
        self.status.tokens_out = counters.tokens_out;
        self.status.eval_tokens_per_second = if counters.eval_ms > 0.0 {
            counters.tokens_out as f64 * 1000.0 / counters.eval_ms
        } else {
            0.0
        };
        self.touch();
    }

    /// Set the activity reported by the worker.
    pub fn set_activity(&mut self, activity: WorkerActivity) {
        if self.status.activity == activity {
            return;
        }
        self.status.activity = activity;
        self.touch();
    }

    pub fn latest(&self) -> Option<&TelemetrySample> {
        self.history.back()
    }

    /// Samples, oldest first.
    pub fn history(&self) -> impl ExactSizeIterator<Item = &TelemetrySample> + '_ {
        self.history.iter()
    }

    pub fn status(&self) -> &RuntimeStatus {
        &self.status
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget samples and counters; used when the model is unloaded.
    pub fn reset(&mut self) {
        self.history.clear();
        self.status = RuntimeStatus::default();
        self.touch();
    }

    fn touch(&mut self) {
        self.status.updated_at = Some(Utc::now());
        self.hook.on_status(&self.status);
    }
}
