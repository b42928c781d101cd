//! `DictationEngine` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! DictationEngine::new()
//!     └─► start_listening()   → device open, status = Starting → Listening
//!         └─► stop_listening()→ device closed, finalized text flushed,
//!                               status = Stopping → Ended → Idle
//! ```
//!
//! `start_listening()` while a session is active is a silent no-op;
//! `stop_listening()` is safe in any state and never fails.
//!
//! ## Threading
//!
//! Device callbacks, timer fires, and public calls may arrive on any
//! thread. All session state sits behind one `parking_lot::Mutex`; the
//! session epoch is bumped whenever a session is opened or torn down, and
//! every device event carries the epoch of the open it belongs to, so
//! anything delivered after a logical stop is discarded. Device
//! `open`/`close` calls are never made while the state lock is held,
//! which lets backends deliver events synchronously from inside `open`.

pub mod session;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::device::{CaptureOptions, DeviceHandle, Hypothesis};
use crate::error::{DictationError, Result};
use crate::events::{CaptureErrorEvent, EngineStatus, EngineStatusEvent, TranscriptUpdate};
use crate::timer::Timers;

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `DictationEngine`. Immutable per engine instance.
#[derive(Debug, Clone)]
pub struct DictationConfig {
    /// BCP-47 language tag requested from the capture backend.
    /// Default: `"en-US"`.
    pub language: String,
    /// Ask the device to keep listening across utterance boundaries.
    /// Mobile backends are known to ignore this. Default: true.
    pub continuous: bool,
    /// Ask the device for provisional hypotheses while an utterance is
    /// still being spoken. Default: true.
    pub interim_results: bool,
    /// Reopen the device after it ends a session the caller did not stop.
    /// Default: false.
    pub auto_restart: bool,
    /// Minimum spacing between transcript notifications. Zero delivers
    /// synchronously. Default: 250 ms.
    pub result_debounce: Duration,
    /// Base delay before an auto-restart reopen. Default: 300 ms.
    pub restart_delay: Duration,
    /// Consecutive restarts without a productive result event before the
    /// engine gives up. Default: 5.
    pub max_restart_attempts: u32,
    /// Ceiling for the escalating restart backoff. Default: 10 s.
    pub max_restart_backoff: Duration,
}

impl Default for DictationConfig {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            continuous: true,
            interim_results: true,
            auto_restart: false,
            result_debounce: Duration::from_millis(250),
            restart_delay: Duration::from_millis(300),
            max_restart_attempts: 5,
            max_restart_backoff: Duration::from_secs(10),
        }
    }
}

/// State shared between the engine handle, device sinks, and the timer
/// worker.
pub(crate) struct Shared {
    pub(crate) config: DictationConfig,
    pub(crate) device: DeviceHandle,
    pub(crate) state: Mutex<session::SessionState>,
    pub(crate) timers: Timers,
    pub(crate) transcript_tx: broadcast::Sender<TranscriptUpdate>,
    pub(crate) status_tx: broadcast::Sender<EngineStatusEvent>,
    pub(crate) error_tx: broadcast::Sender<CaptureErrorEvent>,
}

pub(crate) fn capture_options(config: &DictationConfig) -> CaptureOptions {
    CaptureOptions {
        language: config.language.clone(),
        continuous: config.continuous,
        interim_results: config.interim_results,
    }
}

/// Event surface handed to a capture backend on `open`.
///
/// Each sink is tied to the session epoch it was created for; deliveries
/// from a closed or superseded session are discarded. Sinks hold only a
/// weak reference, so a backend that outlives its engine delivers into
/// the void instead of keeping the engine alive.
#[derive(Clone)]
pub struct CaptureSink {
    shared: Weak<Shared>,
    epoch: u64,
}

impl CaptureSink {
    pub(crate) fn new(shared: Weak<Shared>, epoch: u64) -> Self {
        Self { shared, epoch }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Sink attached to no engine; every delivery is a no-op.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            shared: Weak::new(),
            epoch: 0,
        }
    }

    /// The device confirmed the capture session is live.
    pub fn session_started(&self) {
        if let Some(shared) = self.shared.upgrade() {
            session::on_started(&shared, self.epoch);
        } else {
            debug!("started event delivered to a dropped engine");
        }
    }

    /// New tail of the device's cumulative result list.
    pub fn results(&self, results: &[Hypothesis], start_index: usize) {
        if let Some(shared) = self.shared.upgrade() {
            session::on_results(&shared, self.epoch, results, start_index);
        } else {
            debug!("result event delivered to a dropped engine");
        }
    }

    /// The device closed the session (requested or not).
    pub fn session_ended(&self) {
        if let Some(shared) = self.shared.upgrade() {
            session::on_ended(&shared, self.epoch);
        } else {
            debug!("ended event delivered to a dropped engine");
        }
    }

    /// The device reported a failure code.
    pub fn error(&self, code: &str) {
        if let Some(shared) = self.shared.upgrade() {
            session::on_error(&shared, self.epoch, code);
        } else {
            debug!(code, "error event delivered to a dropped engine");
        }
    }
}

impl std::fmt::Debug for CaptureSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSink")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// The top-level engine handle.
///
/// `DictationEngine` is `Send + Sync` — all fields use interior
/// mutability. Instances are fully independent: one per question field is
/// the intended usage, with no cross-talk between them.
pub struct DictationEngine {
    shared: Arc<Shared>,
}

impl DictationEngine {
    /// Create a new engine. Does not touch the device — call
    /// `start_listening()` to open a capture session.
    pub fn new(config: DictationConfig, device: DeviceHandle) -> Self {
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (error_tx, _) = broadcast::channel(BROADCAST_CAP);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let timers = Timers::spawn({
                let weak = weak.clone();
                move |slot| session::on_timer(&weak, slot)
            });
            Shared {
                config,
                device,
                state: Mutex::new(session::SessionState::new()),
                timers,
                transcript_tx,
                status_tx,
                error_tx,
            }
        });

        Self { shared }
    }

    /// Open a fresh capture session.
    ///
    /// Clears the previous transcript, requests the device open (which
    /// may block while the runtime shows a permission prompt), and
    /// transitions Idle → Starting → Listening. Calling this while a
    /// session is active is a silent no-op.
    ///
    /// # Errors
    /// - `DictationError::Unsupported` if the capture API is unavailable.
    /// - `DictationError::NotAllowed` if microphone permission is denied.
    /// - `DictationError::Device` for any other open failure.
    ///
    /// Every failure is also published on the error stream and leaves the
    /// engine in `Errored` with no half-open session.
    pub fn start_listening(&self) -> Result<()> {
        let (sink, options) = {
            let mut st = self.shared.state.lock();
            if st.phase.is_active() {
                debug!(phase = ?st.phase, "start_listening ignored — session already active");
                return Ok(());
            }
            st.begin_session();
            session::set_phase(&self.shared, &mut st, EngineStatus::Starting, None);
            (
                CaptureSink::new(Arc::downgrade(&self.shared), st.epoch),
                capture_options(&self.shared.config),
            )
        };

        let open_result = {
            let mut device = self.shared.device.0.lock();
            if device.is_supported() {
                // Tear down any handle left over from an errored session
                // before opening a new capture stream.
                device.close();
                device.open(&options, sink.clone())
            } else {
                Err(DictationError::Unsupported)
            }
        };

        match open_result {
            Ok(()) => {
                // A stop racing the open may have invalidated the session
                // between our unlock and the device confirming.
                let stale = self.shared.state.lock().epoch != sink.epoch();
                if stale {
                    self.shared.device.0.lock().close();
                }
                Ok(())
            }
            Err(e) => {
                let mut st = self.shared.state.lock();
                if st.epoch == sink.epoch() {
                    session::fail_session(&self.shared, &mut st, &e);
                }
                Err(e)
            }
        }
    }

    /// Close the current session, if any.
    ///
    /// Cancels the pending notification and restart timers, closes the
    /// device, flushes the finalized transcript exactly once (suppressed
    /// when empty or already delivered), and settles in `Idle`. Safe to
    /// call in any state.
    pub fn stop_listening(&self) {
        {
            let mut st = self.shared.state.lock();
            if !st.phase.is_active() || st.phase == EngineStatus::Stopping {
                debug!(phase = ?st.phase, "stop_listening ignored");
                return;
            }
            st.invalidate_session();
            self.shared.timers.cancel_all();
            session::set_phase(&self.shared, &mut st, EngineStatus::Stopping, None);
        }

        self.shared.device.0.lock().close();

        let mut st = self.shared.state.lock();
        st.transcript.clear_interim();
        session::flush_finalized(&self.shared, &mut st);
        session::set_phase(&self.shared, &mut st, EngineStatus::Ended, None);
        session::set_phase(&self.shared, &mut st, EngineStatus::Idle, None);
        info!("dictation session stopped");
    }

    /// Current phase snapshot.
    pub fn status(&self) -> EngineStatus {
        self.shared.state.lock().phase
    }

    /// Current reconciled transcript, computed on demand.
    pub fn transcript(&self) -> String {
        self.shared.state.lock().transcript.snapshot()
    }

    /// Whether the capture backend exists in this runtime.
    pub fn is_supported(&self) -> bool {
        self.shared.device.0.lock().is_supported()
    }

    /// Subscribe to debounced transcript updates.
    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptUpdate> {
        self.shared.transcript_tx.subscribe()
    }

    /// Subscribe to phase change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// Subscribe to normalized capture error events.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<CaptureErrorEvent> {
        self.shared.error_tx.subscribe()
    }
}

impl Drop for DictationEngine {
    fn drop(&mut self) {
        let was_active = {
            let mut st = self.shared.state.lock();
            let was_active = st.phase.is_active();
            st.invalidate_session();
            was_active
        };
        self.shared.timers.cancel_all();
        if was_active {
            self.shared.device.0.lock().close();
        }
    }
}

impl std::fmt::Debug for DictationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictationEngine")
            .field("status", &self.shared.state.lock().phase)
            .finish_non_exhaustive()
    }
}
