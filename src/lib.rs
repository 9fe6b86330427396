//! Streaming multi-turn inference sessions over a single model.
//!
//! [`SessionController`] accepts load/unload/generate/stop calls from any
//! thread and forwards them to a [`GenerationWorker`] running on a dedicated
//! thread, which is the only code that touches the runtime handles. The
//! conversation's token history stays in the runtime's KV cache, so each turn
//! only decodes its new tokens.
//!
//! The runtime is pluggable through [`llama_engine::InferenceRuntime`]; the
//! `llama-cpp` feature enables the llama.cpp binding, and
//! [`llama_engine::mock::MockRuntime`] is always available for tests.

pub mod config;
pub mod engine;
pub mod error;
pub mod session;

pub use config::EngineConfig;
pub use engine::{
    GenerationRequest, GenerationWorker, ModelSummary, Quantization, StreamEvent, WorkerSignals,
    WorkerState,
};
pub use error::{ConfigError, GenerateError, LoadError, Result, SessionError};
pub use session::{SessionController, TelemetrySnapshot};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
