//! Capture device abstraction.
//!
//! The `CaptureDevice` trait is the boundary to the platform's built-in
//! speech-to-text engine. Implementations are expected to be
//! vendor-inconsistent: mobile builds drop `continuous` mode, some
//! engines never report interim hypotheses, and any of them may close a
//! session unilaterally. The engine wraps whatever it gets defensively;
//! implementors only translate platform callbacks into `CaptureSink`
//! calls.

pub mod stub;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::CaptureSink;
use crate::error::Result;

/// Per-session device configuration, derived from `DictationConfig`.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// BCP-47 language tag, e.g. `"en-US"`.
    pub language: String,
    /// Keep listening across utterance boundaries instead of auto-closing.
    pub continuous: bool,
    /// Report provisional hypotheses while an utterance is in progress.
    pub interim_results: bool,
}

/// One recognition alternative as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hypothesis {
    pub text: String,
    /// `true` once the backend commits to this text and will not revise it.
    pub is_final: bool,
}

impl Hypothesis {
    /// A provisional hypothesis the backend may still revise.
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    /// A committed hypothesis.
    pub fn finalized(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Contract for platform speech-capture backends.
///
/// Lifecycle expectations:
/// - `open` may block while the runtime shows a permission prompt. It
///   must either return an error or eventually report
///   `CaptureSink::session_started`.
/// - `open` tears down any session left over from a previous call; the
///   engine never runs two capture streams at once.
/// - `close` is idempotent and safe on a device that was never opened.
/// - After `close`, any in-flight events the platform still delivers are
///   discarded by the sink's epoch check; implementations need not
///   suppress them.
pub trait CaptureDevice: Send + 'static {
    /// Whether the capture API exists in this runtime at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Begin a capture session, delivering events through `sink`.
    fn open(&mut self, options: &CaptureOptions, sink: CaptureSink) -> Result<()>;

    /// Tear down the current session, if any.
    fn close(&mut self);
}

/// Thread-safe reference-counted handle to any `CaptureDevice` implementor.
///
/// `parking_lot::Mutex` keeps the handle non-poisoning; the engine holds
/// the lock only for the duration of an `open`/`close` call.
#[derive(Clone)]
pub struct DeviceHandle(pub Arc<Mutex<dyn CaptureDevice>>);

impl DeviceHandle {
    /// Wrap any `CaptureDevice` in a `DeviceHandle`.
    pub fn new<D: CaptureDevice>(device: D) -> Self {
        Self(Arc::new(Mutex::new(device)))
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle").finish_non_exhaustive()
    }
}
