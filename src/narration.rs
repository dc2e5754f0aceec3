//! Narration de-duplication.
//!
//! The gate compares candidate text against the last accepted utterance and
//! rejects exact repeats. Content-based only: identical text is suppressed
//! no matter how much time has passed, and new text always speaks.

use std::time::Instant;

/// User-adjustable speech settings, read at speak time rather than cached
/// at narration-decision time.
#[derive(Debug, Clone)]
pub struct SpeechParams {
    pub voice: String,
    pub rate: f32,
}

/// Last-spoken record plus the acceptance policy.
#[derive(Debug, Default)]
pub struct NarrationGate {
    last_spoken: Option<String>,
    last_spoken_at: Option<Instant>,
}

impl NarrationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the candidate differs (after trim, case-sensitive) from the
    /// last accepted text.
    pub fn should_speak(&self, text: &str) -> bool {
        match &self.last_spoken {
            Some(last) => last != text.trim(),
            None => true,
        }
    }

    /// Record an accepted utterance.
    pub fn record(&mut self, text: &str) {
        self.last_spoken = Some(text.trim().to_string());
        self.last_spoken_at = Some(Instant::now());
    }

    pub fn last_spoken_at(&self) -> Option<Instant> {
        self.last_spoken_at
    }
}
