//! # llama-runtime
//!
//! Runtime-side pieces of llama-chat:
//! - [`telemetry`]: request timing, the rolling status and the bounded sample log
//! - `llamacpp` (feature `llama-cpp`): [`LlamaCppRuntime`], the
//!   [`InferenceRuntime`](llama_engine::InferenceRuntime) implementation over
//!   llama.cpp

#[cfg(feature = "llama-cpp")]
pub mod llamacpp;
pub mod telemetry;

#[cfg(feature = "llama-cpp")]
pub use llamacpp::LlamaCppRuntime;
pub use telemetry::{
    InferenceMetrics, InferenceTimer, LogTelemetry, NoopTelemetry, RuntimeStatus,
    TelemetryAggregator, TelemetryHook, TelemetrySample, WorkerActivity,
};
