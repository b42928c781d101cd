//! # viva-speech
//!
//! Dictation engine for the Viva interview-practice app.
//!
//! ## Architecture
//!
//! ```text
//! CaptureDevice (platform STT) ── CaptureSink events ──► DictationEngine
//!                                                             │
//!                                                   transcript reconciliation
//!                                                   (finalized + interim)
//!                                                             │
//!                                                     debounce timer
//!                                                             │
//!                                           broadcast::Sender<TranscriptUpdate>
//! ```
//!
//! The engine treats the capture backend as an unreliable external
//! resource: vendor-specific, free to drop `continuous` mode, time out a
//! session unilaterally, or never deliver interim results. All of that is
//! absorbed here so the question field only ever sees a coherent,
//! monotonically growing transcript.
//!
//! Event delivery to device callbacks and public calls may interleave on
//! arbitrary threads; the session epoch decides which events are still
//! current, and everything after a stop is discarded.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod timer;
pub mod transcript;

// Convenience re-exports for downstream crates
pub use device::{CaptureDevice, CaptureOptions, DeviceHandle, Hypothesis};
pub use engine::{CaptureSink, DictationConfig, DictationEngine};
pub use error::DictationError;
pub use events::{CaptureErrorEvent, EngineStatus, EngineStatusEvent, ErrorKind, TranscriptUpdate};
