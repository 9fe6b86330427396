//! Session controller scenarios: threads, channels, stop handshake, telemetry.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use llama_chat::{
    EngineConfig, GenerateError, LoadError, SessionController, SessionError, StreamEvent,
    WorkerState,
};
use llama_engine::mock::{MockRuntime, ScriptEnd};
use llama_runtime::{
    LogTelemetry, RuntimeStatus, TelemetryHook, TelemetrySample, WorkerActivity,
};
use tempfile::NamedTempFile;

const WAIT: Duration = Duration::from_secs(5);

fn model_file() -> NamedTempFile {
    tempfile::Builder::new()
        .suffix(".Q8_0.gguf")
        .tempfile()
        .unwrap()
}

fn loaded(rt: &MockRuntime, config: EngineConfig) -> (SessionController, NamedTempFile) {
    let file = model_file();
    let session = SessionController::spawn(rt.clone(), config).unwrap();
    session.load_model(file.path()).unwrap();
    (session, file)
}

/// Collect events up to and including the next terminal one.
fn until_terminal(rx: &Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx.recv_timeout(WAIT).expect("no terminal event");
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

fn wait_for_fragment(rx: &Receiver<StreamEvent>) {
    loop {
        match rx.recv_timeout(WAIT).expect("no fragment") {
            StreamEvent::TokenFragment(_) => return,
            e if e.is_terminal() => panic!("finished before first fragment: {e:?}"),
            _ => {}
        }
    }
}

#[test]
fn hello_scenario() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    let events = until_terminal(&events);

    assert!(matches!(events[0], StreamEvent::Started { .. }));
    assert!(events.iter().any(|e| matches!(e, StreamEvent::TokenFragment(_))));
    match events.last().unwrap() {
        StreamEvent::Finished {
            token_count,
            duration_ms,
            ..
        } => {
            assert!(*token_count > 0);
            assert!(*duration_ms > 0.0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!session.is_generating());
    assert_eq!(session.state(), WorkerState::Ready);

    let telemetry = session.telemetry();
    assert_eq!(telemetry.history.len(), 1);
    let sample = telemetry.latest.unwrap();
    assert_eq!(sample.tokens_out, 7);
    assert!(sample.tokens_per_second > 0.0);
    assert_eq!(telemetry.status.activity, WorkerActivity::Ready);
}

#[test]
fn request_id_matches_started_event() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();
    let id = session.send_message("Hello").unwrap();
    match &until_terminal(&events)[0] {
        StreamEvent::Started { request_id, .. } => assert_eq!(*request_id, id),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn second_turn_uses_continuation_prompt() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    until_terminal(&events);
    rt.clear_tokenize_calls();

    session.send_message("How are you?").unwrap();
    until_terminal(&events);

    let calls = rt.tokenize_calls();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|c| !c.add_special));
    assert!(calls.iter().all(|c| !c.text.contains("You are a helpful assistant.")));
}

#[test]
fn send_while_generating_is_busy() {
    let rt = MockRuntime::new()
        .with_end(ScriptEnd::Never)
        .with_decode_delay(Duration::from_millis(2));
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    assert!(session.is_generating());
    assert_eq!(session.send_message("again"), Err(SessionError::Busy));
    assert_eq!(session.clear_context(), Err(SessionError::Busy));

    assert!(session.stop_generation());
    let events = until_terminal(&events);
    assert!(matches!(events.last(), Some(StreamEvent::Stopped { .. })));
    // exactly one request ran
    let started = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Started { .. }))
        .count();
    assert_eq!(started, 1);
}

#[test]
fn stop_before_first_fragment() {
    let rt = MockRuntime::new()
        .with_end(ScriptEnd::Never)
        .with_decode_delay(Duration::from_millis(5));
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    session.stop_generation();
    let events = until_terminal(&events);

    match events.last().unwrap() {
        StreamEvent::Stopped { token_count, .. } => assert_eq!(*token_count, 0),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::TokenFragment(_))));
    assert!(!session.is_generating());
}

#[test]
fn stop_when_idle_is_noop() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    assert!(!session.stop_generation());
    assert!(!session.stop_generation());

    // a stale stop must not affect the next request
    let events = session.subscribe();
    session.send_message("Hello").unwrap();
    assert!(matches!(
        until_terminal(&events).last(),
        Some(StreamEvent::Finished { .. })
    ));
}

#[test]
fn unload_while_generating() {
    let rt = MockRuntime::new()
        .with_end(ScriptEnd::Never)
        .with_decode_delay(Duration::from_millis(2));
    let config = EngineConfig::default();
    let window = config.controller.stop_window();
    let (session, _file) = loaded(&rt, config);
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    wait_for_fragment(&events);

    let started = Instant::now();
    session.unload_model().unwrap();
    assert!(started.elapsed() <= window + Duration::from_millis(250));

    assert!(!session.is_loaded());
    assert!(!session.is_generating());
    assert_eq!(session.state(), WorkerState::Idle);
    assert!(session.model_summary().is_none());
    assert!(matches!(
        until_terminal(&events).last(),
        Some(StreamEvent::Stopped { .. })
    ));

    let live = rt.live_handles();
    assert_eq!((live.models, live.contexts, live.samplers), (0, 0, 0));
}

#[test]
fn reload_while_generating_replaces_model() {
    let rt = MockRuntime::new()
        .with_end(ScriptEnd::Never)
        .with_decode_delay(Duration::from_millis(2));
    let (session, _first) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    wait_for_fragment(&events);

    let second = model_file();
    let summary = session.load_model(second.path()).unwrap();
    assert_eq!(summary.path, second.path());
    assert!(session.is_loaded());
    assert!(!session.is_generating());

    let live = rt.live_handles();
    assert_eq!((live.models, live.contexts, live.samplers), (1, 1, 1));
    assert_eq!(rt.load_count(), 2);
    assert_eq!(rt.order_violations(), 0);
}

#[test]
fn load_failure_leaves_no_model() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());

    let err = session.load_model("/no/such/model.gguf").unwrap_err();
    assert!(matches!(err, SessionError::Load(LoadError::NotFound(_))));
    assert!(!session.is_loaded());
    assert!(session.model_summary().is_none());
    assert_eq!(rt.live_handles().models, 0);
}

#[test]
fn send_without_model_is_rejected() {
    let session = SessionController::spawn(MockRuntime::new(), EngineConfig::default()).unwrap();
    assert_eq!(
        session.send_message("Hello"),
        Err(SessionError::Generate(GenerateError::NotLoaded))
    );
    assert!(!session.is_generating());
}

#[test]
fn clear_context_restarts_turns() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    until_terminal(&events);
    session.clear_context().unwrap();

    rt.clear_tokenize_calls();
    session.send_message("Hello again").unwrap();
    until_terminal(&events);
    assert!(rt.tokenize_calls().iter().all(|c| c.add_special));
}

#[test]
fn telemetry_history_is_bounded() {
    let rt = MockRuntime::new();
    let mut config = EngineConfig::default();
    config.telemetry.history_capacity = 3;
    let (session, _file) = loaded(&rt, config);
    let events = session.subscribe();

    for i in 0..5 {
        session.send_message(&format!("turn {i}")).unwrap();
        until_terminal(&events);
    }
    let telemetry = session.telemetry();
    assert_eq!(telemetry.history.len(), 3);
    assert_eq!(telemetry.latest.as_ref(), telemetry.history.last());
}

#[test]
fn telemetry_resets_on_unload() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();
    session.send_message("Hello").unwrap();
    until_terminal(&events);

    session.unload_model().unwrap();
    let telemetry = session.telemetry();
    assert!(telemetry.history.is_empty());
    assert!(telemetry.latest.is_none());
}

#[test]
fn log_hook_receives_samples() {
    let rt = MockRuntime::new();
    let hook = LogTelemetry::new();
    let file = model_file();
    let session =
        SessionController::spawn_with_hook(rt, EngineConfig::default(), Box::new(hook.clone()))
            .unwrap();
    session.load_model(file.path()).unwrap();
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    until_terminal(&events);
    assert_eq!(hook.last_sample().unwrap().tokens_out, 7);
}

#[test]
fn dropped_subscriber_is_pruned() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    drop(session.subscribe());
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    assert!(matches!(
        until_terminal(&events).last(),
        Some(StreamEvent::Finished { .. })
    ));
}

#[test]
fn every_subscriber_sees_the_same_stream() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let a = session.subscribe();
    let b = session.subscribe();

    session.send_message("Hello").unwrap();
    assert_eq!(until_terminal(&a), until_terminal(&b));
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = EngineConfig::default();
    config.generation.fragment_batch = 0;
    let err = SessionController::spawn(MockRuntime::new(), config).err().unwrap();
    assert!(matches!(err, SessionError::Config(_)));
}

#[test]
fn drop_while_generating_releases_everything() {
    let rt = MockRuntime::new()
        .with_end(ScriptEnd::Never)
        .with_decode_delay(Duration::from_millis(2));
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();
    session.send_message("Hello").unwrap();
    wait_for_fragment(&events);

    drop(session);
    let live = rt.live_handles();
    assert_eq!((live.models, live.contexts, live.samplers), (0, 0, 0));
}

/// Makes the relay thread lag behind the worker.
struct SlowStatusHook;

impl TelemetryHook for SlowStatusHook {
    fn on_sample(&self, _sample: &TelemetrySample) {}

    fn on_status(&self, _status: &RuntimeStatus) {
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn unload_while_generating_discards_in_flight_sample() {
    let rt = MockRuntime::new()
        .with_end(ScriptEnd::Never)
        .with_decode_delay(Duration::from_millis(2));
    let file = model_file();
    let session =
        SessionController::spawn_with_hook(rt, EngineConfig::default(), Box::new(SlowStatusHook))
            .unwrap();
    session.load_model(file.path()).unwrap();
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    wait_for_fragment(&events);
    session.unload_model().unwrap();

    assert!(!session.is_loaded());
    assert!(session.telemetry().history.is_empty());
    assert!(matches!(
        until_terminal(&events).last(),
        Some(StreamEvent::Stopped { .. })
    ));
    // nothing from the old model arrives late
    thread::sleep(Duration::from_millis(200));
    let telemetry = session.telemetry();
    assert!(telemetry.history.is_empty());
    assert!(telemetry.latest.is_none());
}

#[test]
fn failed_load_clears_telemetry() {
    let rt = MockRuntime::new();
    let (session, _file) = loaded(&rt, EngineConfig::default());
    let events = session.subscribe();
    session.send_message("Hello").unwrap();
    until_terminal(&events);
    assert_eq!(session.telemetry().history.len(), 1);

    assert!(session.load_model("/no/such/model.gguf").is_err());
    assert!(session.telemetry().history.is_empty());
}

#[test]
fn unload_timeout_still_forgets_model() {
    let rt = MockRuntime::new()
        .with_end(ScriptEnd::Never)
        .with_decode_delay(Duration::from_millis(150));
    let mut config = EngineConfig::default();
    config.controller.stop_poll_retries = 2;
    config.controller.stop_poll_interval_ms = 10;
    let (session, _file) = loaded(&rt, config);
    let events = session.subscribe();

    session.send_message("Hello").unwrap();
    loop {
        if let StreamEvent::Started { .. } = events.recv_timeout(WAIT).expect("not started") {
            break;
        }
    }

    assert!(matches!(session.unload_model(), Err(SessionError::Timeout(_))));
    assert!(session.model_summary().is_none());

    // the queued unload still runs on the worker
    assert!(matches!(
        until_terminal(&events).last(),
        Some(StreamEvent::Stopped { .. })
    ));
    let deadline = Instant::now() + WAIT;
    while session.is_loaded() || !session.telemetry().history.is_empty() {
        assert!(Instant::now() < deadline, "worker never unloaded");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(rt.live_handles().models, 0);
}
