//! High-level inference session management.
//!
//! A [`SessionController`] is the thread-safe façade over the inference
//! worker. Any thread may call it; every call is turned into a message for the
//! worker thread, and the worker's events are fanned out to subscribers by a
//! second `session-relay` thread that also feeds the telemetry aggregator.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use llama_engine::InferenceRuntime;
use llama_runtime::{NoopTelemetry, RuntimeStatus, TelemetryAggregator, TelemetryHook, TelemetrySample};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ControllerConfig, EngineConfig};
use crate::engine::actor::{WorkerHandle, WorkerOutput};
use crate::engine::{GenerationRequest, ModelSummary, StreamEvent, WorkerState};
use crate::error::{GenerateError, Result, SessionError};

type Subscribers = Arc<Mutex<Vec<Sender<StreamEvent>>>>;

/// Point-in-time copy of the telemetry aggregator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub status: RuntimeStatus,
    pub latest: Option<TelemetrySample>,
    /// Oldest first.
    pub history: Vec<TelemetrySample>,
}

/// An interactive inference session over one model at a time.
pub struct SessionController {
    worker: WorkerHandle,
    relay: Option<thread::JoinHandle<()>>,
    subscribers: Subscribers,
    telemetry: Arc<Mutex<TelemetryAggregator>>,
    summary: Mutex<Option<ModelSummary>>,
    next_turn: AtomicUsize,
    controller: ControllerConfig,
}

impl SessionController {
    /// Validate `config` and start the worker and relay threads.
    pub fn spawn<R: InferenceRuntime>(runtime: R, config: EngineConfig) -> Result<Self> {
        Self::spawn_with_hook(runtime, config, Box::new(NoopTelemetry))
    }

    pub fn spawn_with_hook<R: InferenceRuntime>(
        runtime: R,
        config: EngineConfig,
        hook: Box<dyn TelemetryHook>,
    ) -> Result<Self> {
        config.validate()?;

        let (out_tx, out_rx) = bounded(config.controller.event_capacity.max(1));
        let subscribers: Subscribers = Arc::default();
        let telemetry = Arc::new(Mutex::new(TelemetryAggregator::with_hook(
            config.telemetry.history_capacity,
            hook,
        )));

        let relay = {
            let subscribers = Arc::clone(&subscribers);
            let telemetry = Arc::clone(&telemetry);
            thread::Builder::new()
                .name("session-relay".into())
                .spawn(move || relay_loop(out_rx, subscribers, telemetry))
                .map_err(|_| SessionError::WorkerUnavailable)?
        };

        let controller = config.controller.clone();
        let worker = WorkerHandle::spawn(runtime, config, out_tx)?;

        Ok(SessionController {
            worker,
            relay: Some(relay),
            subscribers,
            telemetry,
            summary: Mutex::new(None),
            next_turn: AtomicUsize::new(0),
            controller,
        })
    }

    /// Receive every [`StreamEvent`] published from now on.
    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Enqueue one user turn and return its request id without waiting.
    ///
    /// Fails with `Busy` while a previous request has not reached its terminal
    /// event.
    pub fn send_message(&self, text: &str) -> Result<Uuid> {
        if !self.is_loaded() {
            return Err(GenerateError::NotLoaded.into());
        }
        let turn_index = self.next_turn.fetch_add(1, Ordering::AcqRel);
        let request = GenerationRequest::new(text, turn_index);
        let id = request.id;
        if let Err(e) = self.worker.submit(request) {
            self.next_turn.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        debug!(request = %id, turn = turn_index, "message queued");
        Ok(id)
    }

    /// Load the model at `path`, replacing the current one.
    ///
    /// An in-flight generation is stopped first. Blocks until the worker has
    /// built the new handles.
    pub fn load_model(&self, path: impl AsRef<Path>) -> Result<ModelSummary> {
        self.halt_generation();
        let reply = self.worker.load(path.as_ref().to_path_buf())?;
        let result = reply.recv().map_err(|_| SessionError::WorkerUnavailable)?;
        self.next_turn.store(0, Ordering::Release);

        match result {
            Ok(summary) => {
                *self.summary.lock() = Some(summary.clone());
                Ok(summary)
            }
            Err(e) => {
                *self.summary.lock() = None;
                Err(e.into())
            }
        }
    }

    /// Stop any generation and release the model.
    ///
    /// Waits at most the configured stop window for the worker.
    pub fn unload_model(&self) -> Result<()> {
        let window = self.controller.stop_window();
        let started = Instant::now();
        self.halt_generation();

        let reply = self.worker.unload()?;
        // The unload is queued and will run; stop reporting the old model now.
        self.next_turn.store(0, Ordering::Release);
        *self.summary.lock() = None;

        let remaining = window
            .saturating_sub(started.elapsed())
            .max(self.controller.stop_poll_interval());
        reply.recv_timeout(remaining).map_err(|e| match e {
            RecvTimeoutError::Timeout => SessionError::Timeout(window),
            RecvTimeoutError::Disconnected => SessionError::WorkerUnavailable,
        })
    }

    /// Ask the current generation to stop. Safe to call at any time.
    pub fn stop_generation(&self) -> bool {
        self.worker.request_stop()
    }

    /// Forget the conversation, keeping the model.
    pub fn clear_context(&self) -> Result<()> {
        if self.is_generating() {
            return Err(SessionError::Busy);
        }
        let reply = self.worker.clear_context()?;
        reply.recv().map_err(|_| SessionError::WorkerUnavailable)??;
        self.next_turn.store(0, Ordering::Release);
        Ok(())
    }

    /// Stop the in-flight request and wait for the worker to acknowledge.
    ///
    /// Returns `false` when the acknowledgement did not arrive within the
    /// window. Teardown still happens on the worker thread in command order,
    /// so no handle is released mid-decode either way.
    fn halt_generation(&self) -> bool {
        if self.worker.request_stop() {
            debug!("stopping in-flight generation");
        }
        let Ok(ack) = self.worker.sync() else {
            return false;
        };
        let interval = self.controller.stop_poll_interval();
        for _ in 0..self.controller.stop_poll_retries.max(1) {
            match ack.recv_timeout(interval) {
                Ok(()) => return true,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        warn!(
            window = ?self.controller.stop_window(),
            "worker did not acknowledge stop in time"
        );
        false
    }

    pub fn is_generating(&self) -> bool {
        self.worker.signals().is_generating()
    }

    pub fn is_loaded(&self) -> bool {
        self.state().has_model()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.signals().state()
    }

    pub fn model_summary(&self) -> Option<ModelSummary> {
        self.summary.lock().clone()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        let telemetry = self.telemetry.lock();
        TelemetrySnapshot {
            status: telemetry.status().clone(),
            latest: telemetry.latest().cloned(),
            history: telemetry.history().cloned().collect(),
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // The worker thread holds the last output sender; once it has exited
        // the relay loop ends on its own.
        self.worker.shutdown();
        if let Some(relay) = self.relay.take() {
            let _ = relay.join();
        }
    }
}

/// Fan worker output out to subscribers and telemetry.
///
/// Telemetry is reset on `Released`, after every event the old model produced.
fn relay_loop(
    output: Receiver<WorkerOutput>,
    subscribers: Subscribers,
    telemetry: Arc<Mutex<TelemetryAggregator>>,
) {
    for item in output.iter() {
        match item {
            WorkerOutput::Event(event) => {
                if let StreamEvent::Finished {
                    token_count,
                    prompt_tokens,
                    duration_ms,
                    ..
                }
                | StreamEvent::Stopped {
                    token_count,
                    prompt_tokens,
                    duration_ms,
                    ..
                } = &event
                {
                    telemetry
                        .lock()
                        .record(*token_count, *duration_ms, *prompt_tokens);
                }
                subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
            }
            WorkerOutput::State(state) => telemetry.lock().set_activity(state.into()),
            WorkerOutput::Counters(counters) => telemetry.lock().observe_counters(counters),
            WorkerOutput::Released { ack } => {
                telemetry.lock().reset();
                let _ = ack.send(());
            }
        }
    }
}
