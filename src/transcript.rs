//! Session transcript buffer: finalized segments plus one interim slot.
//!
//! The capture backend re-sends a growing hypothesis for the utterance in
//! progress, so interim text is always replaced wholesale; only finalized
//! hypotheses accumulate. Finalized segments are append-only for the life
//! of a session and cleared only when a new session starts.

use crate::device::Hypothesis;

/// Outcome of applying one device result event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    /// Whether any hypothesis was consumed.
    pub changed: bool,
    /// Whether the last consumed hypothesis was a finalized one.
    pub last_was_final: bool,
}

#[derive(Debug, Default)]
pub struct Transcript {
    finalized: Vec<String>,
    interim: String,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a fresh session.
    pub fn clear(&mut self) {
        self.finalized.clear();
        self.interim.clear();
    }

    /// Drop the provisional interim text (device closed mid-utterance).
    pub fn clear_interim(&mut self) {
        self.interim.clear();
    }

    /// Apply the new tail of a cumulative device result list.
    ///
    /// `start_index` is the device's resettable index of the first changed
    /// result; entries before it were already consumed by earlier events.
    pub fn apply(&mut self, results: &[Hypothesis], start_index: usize) -> Applied {
        let mut applied = Applied {
            changed: false,
            last_was_final: false,
        };

        for hypothesis in results.iter().skip(start_index) {
            let text = normalize(&hypothesis.text);
            if hypothesis.is_final {
                if !text.is_empty() {
                    self.finalized.push(text);
                }
                self.interim.clear();
            } else {
                self.interim = text;
            }
            applied.changed = true;
            applied.last_was_final = hypothesis.is_final;
        }

        applied
    }

    /// Full snapshot: finalized segments plus the pending interim, if any.
    pub fn snapshot(&self) -> String {
        let mut text = self.finalized.join(" ");
        if !self.interim.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&self.interim);
        }
        text
    }

    /// Finalized-only snapshot, used by the stop/end flush.
    pub fn finalized_text(&self) -> String {
        self.finalized.join(" ")
    }
}

/// Trim and collapse runs of whitespace into single spaces.
fn normalize(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
