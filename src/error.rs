use thiserror::Error;

use crate::events::ErrorKind;

/// All errors produced by viva-speech.
#[derive(Debug, Error)]
pub enum DictationError {
    #[error("speech capture is not supported in this runtime")]
    Unsupported,

    #[error("microphone permission denied")]
    NotAllowed,

    #[error("capture device error: {0}")]
    Device(String),

    #[error("restart budget exhausted after {attempts} attempts")]
    RestartExhausted { attempts: u32 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DictationError {
    /// Normalized classification reported to subscribers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DictationError::Unsupported => ErrorKind::Unsupported,
            DictationError::NotAllowed => ErrorKind::NotAllowed,
            DictationError::Device(_)
            | DictationError::RestartExhausted { .. }
            | DictationError::Other(_) => ErrorKind::Device,
        }
    }

    /// Map a raw device error code onto the taxonomy.
    ///
    /// Permission-style codes collapse into `NotAllowed`; everything else
    /// is passed through verbatim so the consumer can still see what the
    /// vendor reported.
    pub fn from_device_code(code: &str) -> Self {
        match code {
            "not-allowed" | "service-not-allowed" | "permission-denied" => {
                DictationError::NotAllowed
            }
            other => DictationError::Device(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DictationError>;
