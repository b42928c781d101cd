//! Session event handling.
//!
//! Every raw device event lands here, is validated against the current
//! session epoch and phase, and is folded into the transcript state
//! machine:
//!
//! ```text
//! started  → Starting → Listening
//! result   → reconcile hypotheses, arm/refresh the debounce timer
//! ended    → finalize, or schedule an auto-restart
//! error    → classify; fatal codes tear the session down
//! ```
//!
//! Timer fires re-enter through `on_timer`. Handlers never call into the
//! device while holding the state lock; the restart path prepares under
//! the lock, releases it, and only then reopens the device.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::Hypothesis;
use crate::engine::{capture_options, CaptureSink, DictationConfig, Shared};
use crate::error::DictationError;
use crate::events::{CaptureErrorEvent, EngineStatus, EngineStatusEvent, ErrorKind, TranscriptUpdate};
use crate::timer::TimerSlot;
use crate::transcript::Transcript;

/// All mutable engine state, guarded by `Shared::state`.
pub(crate) struct SessionState {
    pub(crate) phase: EngineStatus,
    /// Bumped on every session open and teardown; device events carrying
    /// an older epoch are discarded.
    pub(crate) epoch: u64,
    pub(crate) transcript: Transcript,
    /// Last snapshot delivered to subscribers, for no-op suppression.
    pub(crate) last_notified: Option<String>,
    /// Whether the notify timer has an update to deliver.
    pub(crate) pending_notify: bool,
    /// Whether the most recent accepted change finalized an utterance.
    pub(crate) pending_is_final: bool,
    /// Consecutive auto-restarts without a productive result event.
    pub(crate) restart_attempts: u32,
    /// Transcript update sequence counter.
    pub(crate) seq: u64,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            phase: EngineStatus::Idle,
            epoch: 0,
            transcript: Transcript::new(),
            last_notified: None,
            pending_notify: false,
            pending_is_final: false,
            restart_attempts: 0,
            seq: 0,
        }
    }

    /// Fresh session: new epoch, empty transcript, reset counters.
    pub(crate) fn begin_session(&mut self) {
        self.epoch += 1;
        self.transcript.clear();
        self.last_notified = None;
        self.pending_notify = false;
        self.pending_is_final = false;
        self.restart_attempts = 0;
    }

    /// Invalidate the current session so late device events and timer
    /// fires are discarded. The transcript is kept — it is cleared only
    /// when the next session begins.
    pub(crate) fn invalidate_session(&mut self) {
        self.epoch += 1;
        self.pending_notify = false;
    }
}

pub(crate) fn set_phase(
    shared: &Shared,
    st: &mut SessionState,
    phase: EngineStatus,
    detail: Option<String>,
) {
    if st.phase != phase {
        debug!(from = ?st.phase, to = ?phase, "phase change");
    }
    st.phase = phase;
    let _ = shared.status_tx.send(EngineStatusEvent {
        status: phase,
        detail,
    });
}

fn emit_error(shared: &Shared, kind: ErrorKind, detail: Option<String>) {
    let _ = shared.error_tx.send(CaptureErrorEvent { kind, detail });
}

fn emit_update(shared: &Shared, st: &mut SessionState, text: String, is_final: bool) {
    let seq = st.seq;
    st.seq += 1;
    st.last_notified = Some(text.clone());
    let _ = shared.transcript_tx.send(TranscriptUpdate {
        seq,
        text,
        is_final,
    });
}

/// Deliver the finalized transcript once at session end. Interim text is
/// provisional and is not part of the flush; an empty or already
/// delivered snapshot is suppressed.
pub(crate) fn flush_finalized(shared: &Shared, st: &mut SessionState) {
    let text = st.transcript.finalized_text();
    if text.is_empty() || st.last_notified.as_deref() == Some(text.as_str()) {
        debug!("final flush suppressed — empty or already delivered");
        return;
    }
    info!(chars = text.len(), "flushing finalized transcript");
    emit_update(shared, st, text, true);
}

/// Open failure during `start_listening`: classify, report, settle in
/// `Errored` with no half-open session.
pub(crate) fn fail_session(shared: &Shared, st: &mut SessionState, err: &DictationError) {
    warn!(error = %err, "capture session failed to open");
    shared.timers.cancel_all();
    emit_error(shared, err.kind(), Some(err.to_string()));
    st.invalidate_session();
    set_phase(shared, st, EngineStatus::Errored, Some(err.to_string()));
}

pub(crate) fn on_started(shared: &Arc<Shared>, epoch: u64) {
    let mut st = shared.state.lock();
    if st.epoch != epoch {
        debug!("discarding stale started event");
        return;
    }
    if st.phase != EngineStatus::Starting {
        debug!(phase = ?st.phase, "unexpected started event");
        return;
    }
    info!("capture session started — listening");
    set_phase(shared, &mut st, EngineStatus::Listening, None);
}

pub(crate) fn on_results(
    shared: &Arc<Shared>,
    epoch: u64,
    results: &[Hypothesis],
    start_index: usize,
) {
    let mut st = shared.state.lock();
    if st.epoch != epoch {
        debug!("discarding stale result event");
        return;
    }
    if st.phase != EngineStatus::Listening {
        debug!(phase = ?st.phase, "result event outside listening phase");
        return;
    }

    let applied = st.transcript.apply(results, start_index);
    if !applied.changed {
        return;
    }

    // A productive session refills the restart budget.
    st.restart_attempts = 0;

    let snapshot = st.transcript.snapshot();
    if snapshot.is_empty() || st.last_notified.as_deref() == Some(snapshot.as_str()) {
        debug!("suppressing no-op transcript update");
        return;
    }

    st.pending_is_final = applied.last_was_final;
    if shared.config.result_debounce.is_zero() {
        let is_final = applied.last_was_final;
        emit_update(shared, &mut st, snapshot, is_final);
    } else {
        st.pending_notify = true;
        shared.timers.arm(
            TimerSlot::Notify,
            Instant::now() + shared.config.result_debounce,
        );
    }
}

pub(crate) fn on_ended(shared: &Arc<Shared>, epoch: u64) {
    let mut st = shared.state.lock();
    if st.epoch != epoch {
        debug!("discarding stale ended event");
        return;
    }
    if !st.phase.is_active() {
        debug!(phase = ?st.phase, "ended event with no active session");
        return;
    }

    // The device will not revise the pending hypothesis anymore.
    st.transcript.clear_interim();
    st.pending_notify = false;
    shared.timers.cancel(TimerSlot::Notify);

    if shared.config.auto_restart {
        if st.restart_attempts < shared.config.max_restart_attempts {
            st.restart_attempts += 1;
            let delay = restart_backoff(&shared.config, st.restart_attempts);
            warn!(
                attempt = st.restart_attempts,
                delay_ms = delay.as_millis() as u64,
                "device ended session unrequested — scheduling restart"
            );
            set_phase(
                shared,
                &mut st,
                EngineStatus::Starting,
                Some("restarting after device-initiated end".into()),
            );
            shared.timers.arm(TimerSlot::Restart, Instant::now() + delay);
            return;
        }

        let err = DictationError::RestartExhausted {
            attempts: st.restart_attempts,
        };
        warn!(attempts = st.restart_attempts, "restart budget exhausted — giving up");
        emit_error(shared, err.kind(), Some(err.to_string()));
        flush_finalized(shared, &mut st);
        st.invalidate_session();
        set_phase(shared, &mut st, EngineStatus::Errored, Some(err.to_string()));
        return;
    }

    info!("device ended session — finalizing");
    flush_finalized(shared, &mut st);
    st.invalidate_session();
    set_phase(shared, &mut st, EngineStatus::Ended, None);
    set_phase(shared, &mut st, EngineStatus::Idle, None);
}

pub(crate) fn on_error(shared: &Arc<Shared>, epoch: u64, code: &str) {
    let mut st = shared.state.lock();
    if st.epoch != epoch {
        debug!(code, "discarding stale error event");
        return;
    }
    if !st.phase.is_active() {
        debug!(code, phase = ?st.phase, "error event with no active session");
        return;
    }

    let err = DictationError::from_device_code(code);
    warn!(code, kind = ?err.kind(), "capture device reported an error");
    emit_error(shared, err.kind(), Some(code.to_string()));

    match err {
        DictationError::NotAllowed | DictationError::Unsupported => {
            // Non-recoverable: tear down now. The trailing ended event the
            // device delivers on its own is discarded by the epoch bump.
            shared.timers.cancel_all();
            st.transcript.clear_interim();
            flush_finalized(shared, &mut st);
            st.invalidate_session();
            set_phase(shared, &mut st, EngineStatus::Errored, Some(err.to_string()));
        }
        _ => {
            // Recoverable device failure: the device follows up with an
            // ended event, where the restart decision is made.
        }
    }
}

pub(crate) fn on_timer(shared: &Weak<Shared>, slot: TimerSlot) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    match slot {
        TimerSlot::Notify => on_notify_timer(&shared),
        TimerSlot::Restart => on_restart_timer(&shared),
    }
}

fn on_notify_timer(shared: &Arc<Shared>) {
    let mut st = shared.state.lock();
    if !st.pending_notify || st.phase != EngineStatus::Listening {
        return;
    }
    st.pending_notify = false;

    // Deliver whatever is current now, not what was current when the
    // timer was armed.
    let snapshot = st.transcript.snapshot();
    if snapshot.is_empty() || st.last_notified.as_deref() == Some(snapshot.as_str()) {
        return;
    }
    let is_final = st.pending_is_final;
    emit_update(shared, &mut st, snapshot, is_final);
}

fn on_restart_timer(shared: &Arc<Shared>) {
    let (sink, options) = {
        let mut st = shared.state.lock();
        if st.phase != EngineStatus::Starting {
            debug!(phase = ?st.phase, "restart timer fired outside a pending restart");
            return;
        }
        st.epoch += 1;
        (
            CaptureSink::new(Arc::downgrade(shared), st.epoch),
            capture_options(&shared.config),
        )
    };

    info!("reopening capture device after unrequested end");
    let open_result = shared.device.0.lock().open(&options, sink.clone());

    match open_result {
        Ok(()) => {
            // A stop racing the reopen may have invalidated the session.
            let stale = shared.state.lock().epoch != sink.epoch();
            if stale {
                shared.device.0.lock().close();
            }
        }
        Err(e) => {
            let mut st = shared.state.lock();
            if st.epoch != sink.epoch() {
                return;
            }
            emit_error(shared, e.kind(), Some(e.to_string()));

            let recoverable =
                matches!(e, DictationError::Device(_) | DictationError::Other(_));
            if recoverable && st.restart_attempts < shared.config.max_restart_attempts {
                st.restart_attempts += 1;
                let delay = restart_backoff(&shared.config, st.restart_attempts);
                warn!(
                    error = %e,
                    attempt = st.restart_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "reopen failed — retrying"
                );
                shared.timers.arm(TimerSlot::Restart, Instant::now() + delay);
            } else {
                warn!(error = %e, "could not reopen capture device — giving up");
                flush_finalized(shared, &mut st);
                st.invalidate_session();
                set_phase(shared, &mut st, EngineStatus::Errored, Some(e.to_string()));
            }
        }
    }
}

/// Escalating restart delay: doubles per consecutive attempt, capped.
fn restart_backoff(config: &DictationConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    config
        .restart_delay
        .saturating_mul(1u32 << shift)
        .min(config.max_restart_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use tokio::sync::broadcast;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::device::stub::{StubCapture, StubHandle};
    use crate::device::DeviceHandle;
    use crate::engine::DictationEngine;

    fn quick_config() -> DictationConfig {
        DictationConfig {
            result_debounce: Duration::ZERO,
            restart_delay: Duration::from_millis(10),
            max_restart_backoff: Duration::from_millis(50),
            ..DictationConfig::default()
        }
    }

    fn engine_with(config: DictationConfig) -> (DictationEngine, StubHandle) {
        let stub = StubCapture::new();
        let handle = stub.handle();
        let engine = DictationEngine::new(config, DeviceHandle::new(stub));
        (engine, handle)
    }

    fn recv_with_timeout<T: Clone>(
        rx: &mut broadcast::Receiver<T>,
        timeout: Duration,
        what: &str,
    ) -> T {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => return ev,
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        panic!("timed out waiting for {what}");
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("{what} channel closed unexpectedly"),
            }
        }
    }

    fn assert_quiet_for<T: Clone + std::fmt::Debug>(
        rx: &mut broadcast::Receiver<T>,
        timeout: Duration,
    ) {
        let start = Instant::now();
        loop {
            match rx.try_recv() {
                Ok(ev) => panic!("expected no event, got {ev:?}"),
                Err(TryRecvError::Empty) => {
                    if start.elapsed() >= timeout {
                        return;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => return,
            }
        }
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn start_is_idempotent_and_opens_once() {
        let (engine, stub) = engine_with(quick_config());
        let mut status_rx = engine.subscribe_status();

        engine.start_listening().expect("first start");
        engine.start_listening().expect("redundant start");

        assert_eq!(engine.status(), EngineStatus::Listening);
        assert_eq!(stub.opens(), 1);

        let first = recv_with_timeout(&mut status_rx, RECV_TIMEOUT, "status");
        let second = recv_with_timeout(&mut status_rx, RECV_TIMEOUT, "status");
        assert_eq!(first.status, EngineStatus::Starting);
        assert_eq!(second.status, EngineStatus::Listening);
        assert_quiet_for(&mut status_rx, Duration::from_millis(100));
    }

    #[test]
    fn interim_updates_overwrite_with_zero_debounce() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_interim("he");
        stub.emit_interim("hello");
        stub.emit_interim("hello wor");

        for expected in ["he", "hello", "hello wor"] {
            let update = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
            assert_eq!(update.text, expected);
            assert!(!update.is_final);
        }
        assert_eq!(engine.transcript(), "hello wor");
    }

    #[test]
    fn finalized_utterance_appends_and_clears_interim() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_interim("hello wor");
        stub.emit_final("hello world");

        let interim = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert!(!interim.is_final);
        let finalized = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(finalized.text, "hello world");
        assert!(finalized.is_final);
        assert_eq!(engine.transcript(), "hello world");
    }

    #[test]
    fn duplicate_snapshot_is_suppressed() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_interim("hello");
        stub.emit_interim("hello");

        let update = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(update.text, "hello");
        assert_quiet_for(&mut updates, Duration::from_millis(100));
    }

    #[test]
    fn whitespace_only_hypothesis_never_notifies() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_interim("   ");
        assert_quiet_for(&mut updates, Duration::from_millis(100));
    }

    #[test]
    fn debounce_collapses_bursts_into_one_update() {
        let config = DictationConfig {
            result_debounce: Duration::from_millis(80),
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        for i in 0..10 {
            stub.emit_interim(&format!("hypothesis {i}"));
        }

        let update = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(update.text, "hypothesis 9");
        assert!(!update.is_final);
        assert_quiet_for(&mut updates, Duration::from_millis(200));
    }

    #[test]
    fn debounced_update_carries_state_at_fire_time() {
        let config = DictationConfig {
            result_debounce: Duration::from_millis(60),
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_interim("tell");
        stub.emit_final("tell me about");

        let update = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(update.text, "tell me about");
        assert!(update.is_final);
        assert_quiet_for(&mut updates, Duration::from_millis(150));
    }

    #[test]
    fn stop_cancels_pending_notification() {
        let config = DictationConfig {
            result_debounce: Duration::from_millis(100),
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_interim("he");
        engine.stop_listening();

        assert_quiet_for(&mut updates, Duration::from_millis(300));
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[test]
    fn stop_flushes_unsent_final_exactly_once() {
        let config = DictationConfig {
            result_debounce: Duration::from_secs(5),
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_final("what is your greatest strength");
        engine.stop_listening();

        let update = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(update.text, "what is your greatest strength");
        assert!(update.is_final);

        // Redundant stop delivers nothing further.
        engine.stop_listening();
        assert_quiet_for(&mut updates, Duration::from_millis(150));
    }

    #[test]
    fn basic_dictation_run_has_no_restart() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        let mut status_rx = engine.subscribe_status();
        engine.start_listening().expect("start");

        stub.emit_final("what is your greatest strength");
        let update = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(update.text, "what is your greatest strength");
        assert!(update.is_final);

        engine.stop_listening();

        let mut ended_count = 0;
        loop {
            match status_rx.try_recv() {
                Ok(ev) if ev.status == EngineStatus::Ended => ended_count += 1,
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => break,
            }
        }
        assert_eq!(ended_count, 1);

        // Well past restart_delay: no reopen with auto_restart disabled.
        thread::sleep(Duration::from_millis(60));
        assert_eq!(stub.opens(), 1);
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[test]
    fn device_end_without_auto_restart_finalizes() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_final("hello");
        let _ = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");

        stub.end_session();

        assert!(wait_until(RECV_TIMEOUT, || {
            engine.status() == EngineStatus::Idle
        }));
        // The flush is suppressed — the text was already delivered.
        assert_quiet_for(&mut updates, Duration::from_millis(100));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(stub.opens(), 1);
    }

    #[test]
    fn auto_restart_accumulates_across_device_sessions() {
        let config = DictationConfig {
            auto_restart: true,
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_final("tell me about");
        let first = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(first.text, "tell me about");

        stub.end_session();
        assert!(wait_until(RECV_TIMEOUT, || {
            stub.opens() == 2 && engine.status() == EngineStatus::Listening
        }));

        stub.emit_final("a challenge you faced");
        let second = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(second.text, "tell me about a challenge you faced");
        assert!(second.is_final);
        assert_eq!(engine.transcript(), "tell me about a challenge you faced");
    }

    #[test]
    fn restart_budget_exhaustion_reaches_errored() {
        let config = DictationConfig {
            auto_restart: true,
            max_restart_attempts: 2,
            restart_delay: Duration::from_millis(5),
            max_restart_backoff: Duration::from_millis(20),
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        let mut errors = engine.subscribe_errors();
        engine.start_listening().expect("start");

        stub.end_session();
        assert!(wait_until(RECV_TIMEOUT, || stub.opens() == 2));
        assert!(wait_until(RECV_TIMEOUT, || {
            engine.status() == EngineStatus::Listening
        }));

        stub.end_session();
        assert!(wait_until(RECV_TIMEOUT, || stub.opens() == 3));
        assert!(wait_until(RECV_TIMEOUT, || {
            engine.status() == EngineStatus::Listening
        }));

        stub.end_session();
        assert!(wait_until(RECV_TIMEOUT, || {
            engine.status() == EngineStatus::Errored
        }));

        let error = recv_with_timeout(&mut errors, RECV_TIMEOUT, "error");
        assert_eq!(error.kind, ErrorKind::Device);
        assert!(error.detail.expect("detail").contains("restart budget"));

        thread::sleep(Duration::from_millis(60));
        assert_eq!(stub.opens(), 3);
    }

    #[test]
    fn productive_results_refill_the_restart_budget() {
        let config = DictationConfig {
            auto_restart: true,
            max_restart_attempts: 1,
            restart_delay: Duration::from_millis(5),
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        engine.start_listening().expect("start");

        for round in 0..3usize {
            stub.emit_final(&format!("segment {round}"));
            stub.end_session();
            assert!(
                wait_until(RECV_TIMEOUT, || {
                    stub.opens() == round + 2 && engine.status() == EngineStatus::Listening
                }),
                "round {round} did not restart"
            );
        }
        assert_eq!(engine.transcript(), "segment 0 segment 1 segment 2");
    }

    #[test]
    fn open_failure_reports_not_allowed_and_recovers() {
        let (engine, stub) = engine_with(quick_config());
        let mut status_rx = engine.subscribe_status();
        let mut errors = engine.subscribe_errors();
        stub.set_fail_open(Some("not-allowed"));

        let err = engine.start_listening().expect_err("open should fail");
        assert!(matches!(err, DictationError::NotAllowed));
        assert_eq!(engine.status(), EngineStatus::Errored);

        let error = recv_with_timeout(&mut errors, RECV_TIMEOUT, "error");
        assert_eq!(error.kind, ErrorKind::NotAllowed);

        // Starting, then Errored — never Listening.
        let first = recv_with_timeout(&mut status_rx, RECV_TIMEOUT, "status");
        let second = recv_with_timeout(&mut status_rx, RECV_TIMEOUT, "status");
        assert_eq!(first.status, EngineStatus::Starting);
        assert_eq!(second.status, EngineStatus::Errored);

        // A later start retries cleanly.
        stub.set_fail_open(None);
        engine.start_listening().expect("retry");
        assert_eq!(engine.status(), EngineStatus::Listening);
    }

    #[test]
    fn unsupported_runtime_never_opens_the_device() {
        let (engine, stub) = engine_with(quick_config());
        let mut errors = engine.subscribe_errors();
        stub.set_supported(false);

        assert!(!engine.is_supported());
        let err = engine.start_listening().expect_err("start should fail");
        assert!(matches!(err, DictationError::Unsupported));
        assert_eq!(stub.opens(), 0);
        assert_eq!(engine.status(), EngineStatus::Errored);

        let error = recv_with_timeout(&mut errors, RECV_TIMEOUT, "error");
        assert_eq!(error.kind, ErrorKind::Unsupported);
    }

    #[test]
    fn async_permission_error_tears_down_session() {
        let config = DictationConfig {
            auto_restart: true,
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        let mut errors = engine.subscribe_errors();
        engine.start_listening().expect("start");

        stub.emit_error("not-allowed");
        assert_eq!(engine.status(), EngineStatus::Errored);
        let error = recv_with_timeout(&mut errors, RECV_TIMEOUT, "error");
        assert_eq!(error.kind, ErrorKind::NotAllowed);

        // The device's trailing ended event must not trigger a restart.
        stub.end_session();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(engine.status(), EngineStatus::Errored);
        assert_eq!(stub.opens(), 1);

        engine.start_listening().expect("restart after error");
        assert_eq!(engine.status(), EngineStatus::Listening);
    }

    #[test]
    fn permission_loss_mid_session_keeps_finalized_text() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_final("hello world");
        let _ = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");

        stub.emit_error("not-allowed");
        assert_eq!(engine.status(), EngineStatus::Errored);
        assert_eq!(engine.transcript(), "hello world");
    }

    #[test]
    fn recoverable_error_then_end_triggers_restart() {
        let config = DictationConfig {
            auto_restart: true,
            ..quick_config()
        };
        let (engine, stub) = engine_with(config);
        let mut errors = engine.subscribe_errors();
        engine.start_listening().expect("start");

        stub.emit_error("network");
        let error = recv_with_timeout(&mut errors, RECV_TIMEOUT, "error");
        assert_eq!(error.kind, ErrorKind::Device);
        assert_eq!(error.detail.as_deref(), Some("network"));
        assert_eq!(engine.status(), EngineStatus::Listening);

        stub.end_session();
        assert!(wait_until(RECV_TIMEOUT, || stub.opens() == 2));
    }

    #[test]
    fn stale_events_after_stop_are_discarded() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        let mut errors = engine.subscribe_errors();
        engine.start_listening().expect("start");

        let sink = stub.sink().expect("live sink");
        engine.stop_listening();

        sink.results(&[Hypothesis::finalized("late arrival")], 0);
        sink.session_started();
        sink.error("network");
        sink.session_ended();

        assert_quiet_for(&mut updates, Duration::from_millis(100));
        assert_quiet_for(&mut errors, Duration::from_millis(50));
        assert_eq!(engine.status(), EngineStatus::Idle);
        assert_eq!(engine.transcript(), "");
    }

    #[test]
    fn transcript_survives_stop_and_clears_on_next_start() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_final("first question");
        let _ = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        engine.stop_listening();
        assert_eq!(engine.transcript(), "first question");

        engine.start_listening().expect("second start");
        assert_eq!(engine.transcript(), "");

        stub.emit_final("second question");
        let update = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(update.text, "second question");
    }

    #[test]
    fn engines_do_not_crosstalk() {
        let (left, left_stub) = engine_with(quick_config());
        let (right, right_stub) = engine_with(quick_config());
        let mut left_updates = left.subscribe_transcripts();
        let mut right_updates = right.subscribe_transcripts();

        left.start_listening().expect("left start");
        right.start_listening().expect("right start");

        left_stub.emit_final("left question");
        right_stub.emit_final("right question");

        let left_update = recv_with_timeout(&mut left_updates, RECV_TIMEOUT, "left update");
        let right_update = recv_with_timeout(&mut right_updates, RECV_TIMEOUT, "right update");
        assert_eq!(left_update.text, "left question");
        assert_eq!(right_update.text, "right question");

        left.stop_listening();
        assert_eq!(right.status(), EngineStatus::Listening);
    }

    #[test]
    fn cumulative_result_lists_are_consumed_from_the_index() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        let cumulative = [
            Hypothesis::finalized("what is"),
            Hypothesis::finalized("your greatest strength"),
        ];
        stub.emit(&cumulative[..1], 0);
        stub.emit(&cumulative, 1);

        let first = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        let second = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
        assert_eq!(first.text, "what is");
        assert_eq!(second.text, "what is your greatest strength");
    }

    #[test]
    fn update_sequence_numbers_are_monotonic() {
        let (engine, stub) = engine_with(quick_config());
        let mut updates = engine.subscribe_transcripts();
        engine.start_listening().expect("start");

        stub.emit_interim("a");
        stub.emit_interim("a b");
        stub.emit_final("a b c");

        let mut last_seq = None;
        for _ in 0..3 {
            let update = recv_with_timeout(&mut updates, RECV_TIMEOUT, "update");
            if let Some(prev) = last_seq {
                assert!(update.seq > prev);
            }
            last_seq = Some(update.seq);
        }
    }

    #[test]
    fn restart_backoff_escalates_and_caps() {
        let config = DictationConfig {
            restart_delay: Duration::from_millis(100),
            max_restart_backoff: Duration::from_millis(350),
            ..DictationConfig::default()
        };
        assert_eq!(restart_backoff(&config, 1), Duration::from_millis(100));
        assert_eq!(restart_backoff(&config, 2), Duration::from_millis(200));
        assert_eq!(restart_backoff(&config, 3), Duration::from_millis(350));
        assert_eq!(restart_backoff(&config, 30), Duration::from_millis(350));
    }
}
