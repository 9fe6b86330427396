//! Dedicated inference thread.
//!
//! The runtime handles are not thread-safe, so the [`GenerationWorker`] lives
//! on its own OS thread and everything else talks to it through channels.
//!
//! ```text
//! ┌──────────────┐  WorkerCommand (bounded)  ┌──────────────────────┐
//! │  Controller  │ ────────────────────────> │   inference-worker   │
//! │  (any thread)│                           │  Owns: model, ctx,   │
//! │              │ <──────────────────────── │  sampler, session    │
//! └──────────────┘  WorkerOutput (bounded)   └──────────────────────┘
//! ```
//!
//! Commands are processed strictly in order, so a `Sync` acknowledgement
//! proves that every earlier command (including a generation) has returned.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use llama_engine::{InferenceRuntime, PerfCounters};
use tracing::{debug, info};

use super::{GenerationRequest, GenerationWorker, ModelSummary, StreamEvent, WorkerSignals, WorkerState};
use crate::config::EngineConfig;
use crate::error::{GenerateError, LoadError, SessionError};

/// Commands sent to the worker thread.
pub enum WorkerCommand {
    Load {
        path: PathBuf,
        reply: Sender<Result<ModelSummary, LoadError>>,
    },
    /// Run a request. The sender must already hold the generating claim.
    Generate(GenerationRequest),
    ClearContext {
        reply: Sender<Result<(), GenerateError>>,
    },
    Unload {
        reply: Sender<()>,
    },
    /// Acknowledged once every earlier command is done.
    Sync {
        ack: Sender<()>,
    },
    Shutdown,
}

/// Everything the worker thread reports back.
#[derive(Debug, Clone)]
pub enum WorkerOutput {
    Event(StreamEvent),
    State(WorkerState),
    /// Runtime counters after a request.
    Counters(PerfCounters),
    /// The model is gone. Everything reported before this belongs to it. The
    /// receiver answers `ack` once it has caught up.
    Released { ack: Sender<()> },
}

/// Handle to the worker thread.
pub struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    signals: Arc<WorkerSignals>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Move `runtime` onto a new `inference-worker` thread that reports on `output`.
    pub fn spawn<R: InferenceRuntime>(
        runtime: R,
        config: EngineConfig,
        output: Sender<WorkerOutput>,
    ) -> Result<Self, SessionError> {
        let (cmd_tx, cmd_rx) = bounded::<WorkerCommand>(config.controller.command_capacity.max(1));
        let signals = Arc::new(WorkerSignals::new());

        let state_tx = output.clone();
        let worker = GenerationWorker::new(runtime, config, Arc::clone(&signals))
            .with_state_observer(move |state| {
                let _ = state_tx.send(WorkerOutput::State(state));
            });

        let thread = thread::Builder::new()
            .name("inference-worker".into())
            .spawn(move || worker_loop(worker, cmd_rx, output))
            .map_err(|_| SessionError::WorkerUnavailable)?;

        Ok(WorkerHandle {
            commands: cmd_tx,
            signals,
            thread: Some(thread),
        })
    }

    pub fn signals(&self) -> &Arc<WorkerSignals> {
        &self.signals
    }

    fn send(&self, command: WorkerCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::WorkerUnavailable)
    }

    /// Claim the generating flag and enqueue `request`.
    pub fn submit(&self, request: GenerationRequest) -> Result<(), SessionError> {
        if !self.signals.try_claim() {
            return Err(SessionError::Busy);
        }
        self.send(WorkerCommand::Generate(request)).map_err(|e| {
            self.signals.release();
            e
        })
    }

    pub fn load(&self, path: PathBuf) -> Result<Receiver<Result<ModelSummary, LoadError>>, SessionError> {
        let (reply, rx) = bounded(1);
        self.send(WorkerCommand::Load { path, reply })?;
        Ok(rx)
    }

    pub fn clear_context(&self) -> Result<Receiver<Result<(), GenerateError>>, SessionError> {
        let (reply, rx) = bounded(1);
        self.send(WorkerCommand::ClearContext { reply })?;
        Ok(rx)
    }

    pub fn unload(&self) -> Result<Receiver<()>, SessionError> {
        let (reply, rx) = bounded(1);
        self.send(WorkerCommand::Unload { reply })?;
        Ok(rx)
    }

    /// Enqueue a barrier; the receiver yields once the worker reaches it.
    pub fn sync(&self) -> Result<Receiver<()>, SessionError> {
        let (ack, rx) = bounded(1);
        self.send(WorkerCommand::Sync { ack })?;
        Ok(rx)
    }

    /// Ask the in-flight request to stop.
    pub fn request_stop(&self) -> bool {
        self.signals.request_stop()
    }

    /// Stop any request, tell the thread to exit and wait for it.
    pub fn shutdown(&mut self) {
        self.signals.request_stop();
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The main loop running on the dedicated inference thread.
fn worker_loop<R: InferenceRuntime>(
    mut worker: GenerationWorker<R>,
    commands: Receiver<WorkerCommand>,
    output: Sender<WorkerOutput>,
) {
    debug!("inference worker started");
    for command in commands.iter() {
        match command {
            WorkerCommand::Load { path, reply } => {
                let result = worker.load_model(&path);
                if result.is_err() {
                    announce_release(&output);
                }
                let _ = reply.send(result);
            }

            WorkerCommand::Generate(request) => {
                let _ = worker.generate_claimed(&request, |event| {
                    let _ = output.send(WorkerOutput::Event(event));
                });
                if let Some(counters) = worker.performance_counters() {
                    let _ = output.send(WorkerOutput::Counters(counters));
                }
            }

            WorkerCommand::ClearContext { reply } => {
                let _ = reply.send(worker.clear_context());
            }

            WorkerCommand::Unload { reply } => {
                worker.unload();
                info!("model unloaded");
                announce_release(&output);
                let _ = reply.send(());
            }

            WorkerCommand::Sync { ack } => {
                let _ = ack.send(());
            }

            WorkerCommand::Shutdown => break,
        }
    }
    worker.unload();
    debug!("inference worker exited");
}

/// Report a release and block until the output side has processed it.
fn announce_release(output: &Sender<WorkerOutput>) {
    let (ack, done) = bounded(1);
    if output.send(WorkerOutput::Released { ack }).is_ok() {
        let _ = done.recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_engine::mock::MockRuntime;
    use std::time::Duration;

    fn spawn() -> (WorkerHandle, Receiver<WorkerOutput>, MockRuntime) {
        let runtime = MockRuntime::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = WorkerHandle::spawn(runtime.clone(), EngineConfig::default(), tx).unwrap();
        (handle, rx, runtime)
    }

    #[test]
    fn sync_is_acknowledged() {
        let (handle, _rx, _) = spawn();
        let ack = handle.sync().unwrap();
        assert!(ack.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn load_reports_missing_file_and_idle_state() {
        let (handle, rx, _) = spawn();
        let reply = handle.load(PathBuf::from("/nonexistent/model.gguf")).unwrap();

        let mut states = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(1)).unwrap() {
                WorkerOutput::State(s) => states.push(s),
                WorkerOutput::Released { ack } => {
                    ack.send(()).unwrap();
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(states, vec![WorkerState::Loading, WorkerState::Idle]);
        assert!(matches!(reply.recv().unwrap(), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn unload_replies_after_release_is_acknowledged() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (handle, rx, _) = spawn();
        assert!(handle.load(file.path().to_path_buf()).unwrap().recv().unwrap().is_ok());

        let reply = handle.unload().unwrap();
        let ack = loop {
            if let WorkerOutput::Released { ack } = rx.recv_timeout(Duration::from_secs(1)).unwrap() {
                break ack;
            }
        };
        // the worker holds the reply until the release is acknowledged
        assert!(reply.recv_timeout(Duration::from_millis(50)).is_err());
        ack.send(()).unwrap();
        assert!(reply.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn submit_rejects_second_claim() {
        let (handle, _rx, _) = spawn();
        assert!(handle.signals().try_claim());
        let err = handle
            .submit(GenerationRequest::new("hi", 0))
            .unwrap_err();
        assert_eq!(err, SessionError::Busy);
        handle.signals().release();
    }

    #[test]
    fn drop_releases_loaded_handles() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (handle, _rx, runtime) = spawn();
        let reply = handle.load(file.path().to_path_buf()).unwrap();
        assert!(reply.recv().unwrap().is_ok());
        assert_eq!(runtime.live_handles().models, 1);

        drop(handle);
        let live = runtime.live_handles();
        assert_eq!((live.models, live.contexts, live.samplers), (0, 0, 0));
    }
}
