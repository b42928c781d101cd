//! `StubCapture` — scriptable in-memory backend.
//!
//! Used as the test double for the platform speech engine and as a
//! development backend before real platform glue is wired in. The
//! companion `StubHandle` stays usable after the device is handed to an
//! engine, so tests can script session events and inspect open/close
//! traffic from outside.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::device::{CaptureDevice, CaptureOptions, Hypothesis};
use crate::engine::CaptureSink;
use crate::error::{DictationError, Result};

#[derive(Default)]
struct StubState {
    sink: Option<CaptureSink>,
    last_options: Option<CaptureOptions>,
    /// Raw device code the next `open` should fail with.
    fail_open: Option<String>,
}

struct StubShared {
    state: Mutex<StubState>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    /// Report `session_started` synchronously from `open`.
    auto_start: AtomicBool,
    supported: AtomicBool,
}

/// Scriptable capture backend.
pub struct StubCapture {
    shared: Arc<StubShared>,
}

impl StubCapture {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StubShared {
                state: Mutex::new(StubState::default()),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                auto_start: AtomicBool::new(true),
                supported: AtomicBool::new(true),
            }),
        }
    }

    /// Controller handle that remains valid after the device is moved
    /// into an engine.
    pub fn handle(&self) -> StubHandle {
        StubHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for StubCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for StubCapture {
    fn is_supported(&self) -> bool {
        self.shared.supported.load(Ordering::SeqCst)
    }

    fn open(&mut self, options: &CaptureOptions, sink: CaptureSink) -> Result<()> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        let sink_for_start = {
            let mut st = self.shared.state.lock();
            if let Some(code) = st.fail_open.clone() {
                debug!(code, "stub open failing as scripted");
                return Err(DictationError::from_device_code(&code));
            }
            st.last_options = Some(options.clone());
            st.sink = Some(sink.clone());
            sink
        };

        if self.shared.auto_start.load(Ordering::SeqCst) {
            sink_for_start.session_started();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        self.shared.state.lock().sink = None;
    }
}

/// External controller for a `StubCapture` owned by an engine.
#[derive(Clone)]
pub struct StubHandle {
    shared: Arc<StubShared>,
}

impl StubHandle {
    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<CaptureOptions> {
        self.shared.state.lock().last_options.clone()
    }

    pub fn set_supported(&self, supported: bool) {
        self.shared.supported.store(supported, Ordering::SeqCst);
    }

    pub fn set_auto_start(&self, auto_start: bool) {
        self.shared.auto_start.store(auto_start, Ordering::SeqCst);
    }

    /// Script the next `open` calls to fail with `code` (cleared with
    /// `None`).
    pub fn set_fail_open(&self, code: Option<&str>) {
        self.shared.state.lock().fail_open = code.map(str::to_string);
    }

    /// The sink of the currently open session, if any.
    pub fn sink(&self) -> Option<CaptureSink> {
        self.shared.state.lock().sink.clone()
    }

    // ── Event scripting ──────────────────────────────────────────────────
    //
    // Each helper delivers through the live session sink and quietly does
    // nothing when no session is open, mirroring a platform engine whose
    // callbacks simply stop firing once torn down.

    pub fn start_session(&self) {
        if let Some(sink) = self.sink() {
            sink.session_started();
        } else {
            debug!("start_session with no open stub session");
        }
    }

    pub fn emit(&self, results: &[Hypothesis], start_index: usize) {
        if let Some(sink) = self.sink() {
            sink.results(results, start_index);
        } else {
            debug!("emit with no open stub session");
        }
    }

    pub fn emit_interim(&self, text: &str) {
        self.emit(&[Hypothesis::interim(text)], 0);
    }

    pub fn emit_final(&self, text: &str) {
        self.emit(&[Hypothesis::finalized(text)], 0);
    }

    pub fn end_session(&self) {
        let sink = self.sink();
        // The platform engine is gone after an unrequested end; drop the
        // stored sink before delivering so a restart can install a new one.
        self.shared.state.lock().sink = None;
        if let Some(sink) = sink {
            sink.session_ended();
        } else {
            debug!("end_session with no open stub session");
        }
    }

    pub fn emit_error(&self, code: &str) {
        if let Some(sink) = self.sink() {
            sink.error(code);
        } else {
            debug!(code, "emit_error with no open stub session");
        }
    }
}
