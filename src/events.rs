//! Event types delivered to the embedding application.
//!
//! ## Streams
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `TranscriptUpdate` | `DictationEngine::subscribe_transcripts` |
//! | `EngineStatusEvent` | `DictationEngine::subscribe_status` |
//! | `CaptureErrorEvent` | `DictationEngine::subscribe_errors` |
//!
//! All types serialize with camelCase fields so the app shell can forward
//! them over its UI bridge unchanged.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Transcript updates
// ---------------------------------------------------------------------------

/// Emitted whenever the reconciled transcript changes and the debounce
/// window closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptUpdate {
    /// Monotonically increasing per-engine sequence number.
    pub seq: u64,
    /// The full reconciled snapshot (finalized segments + pending interim).
    pub text: String,
    /// `true` when the most recent change finalized an utterance,
    /// `false` when it only revised the interim hypothesis.
    pub is_final: bool,
}

// ---------------------------------------------------------------------------
// Engine status events
// ---------------------------------------------------------------------------

/// Emitted on every engine phase change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message, restart note).
    pub detail: Option<String>,
}

/// Lifecycle phase of a `DictationEngine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// No session. Ready to start.
    Idle,
    /// Capture session requested; waiting for the device to confirm
    /// (includes the permission prompt and auto-restart waits).
    Starting,
    /// Device confirmed — results are flowing.
    Listening,
    /// `stop_listening` in progress; the device is being closed.
    Stopping,
    /// Session completed (stop or un-restarted device end).
    Ended,
    /// Terminal failure — a new `start_listening` is required.
    Errored,
}

impl EngineStatus {
    /// Whether a capture session currently owns the device.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            EngineStatus::Starting | EngineStatus::Listening | EngineStatus::Stopping
        )
    }
}

// ---------------------------------------------------------------------------
// Capture error events
// ---------------------------------------------------------------------------

/// Emitted when the capture backend fails, alongside the status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureErrorEvent {
    pub kind: ErrorKind,
    /// Verbatim device code or failure description, when available.
    pub detail: Option<String>,
}

/// Normalized classification of capture failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Capture API unavailable in this runtime. Non-recoverable.
    Unsupported,
    /// Microphone permission denied or revoked. Non-recoverable without
    /// user action outside the engine.
    NotAllowed,
    /// Any other device-reported failure, passed through verbatim.
    Device,
}
