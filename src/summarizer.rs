//! Detection summarization for narration.
//!
//! Turns a raw detection batch into a short display string and a spoken
//! sentence bounded to three labels, so narration stays terse no matter how
//! busy the scene is.

use std::cmp::Ordering;

use crate::detector::Detection;

/// At most this many detections are considered after sorting.
const MAX_CANDIDATES: usize = 6;
/// At most this many distinct labels are spoken.
const MAX_SPOKEN: usize = 3;

/// A display string plus the sentence to speak.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub display: String,
    pub speech: String,
}

#[derive(Debug, Clone)]
pub struct Summarizer {
    speech_confidence: f32,
}

impl Summarizer {
    pub fn new(speech_confidence: f32) -> Self {
        Self { speech_confidence }
    }

    /// Summarize a detection batch. Never fails; an empty or all-filtered
    /// batch produces the fixed "nothing recognizable" pair.
    pub fn summarize(&self, detections: &[Detection]) -> Summary {
        let mut kept: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.speech_confidence)
            .collect();
        // Stable: ties keep encounter order
        kept.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });

        let mut labels: Vec<&str> = Vec::new();
        for d in kept.iter().take(MAX_CANDIDATES) {
            if !labels.contains(&d.label.as_str()) {
                labels.push(d.label.as_str());
            }
        }
        labels.truncate(MAX_SPOKEN);

        let speech = match labels.as_slice() {
            [] => {
                return Summary {
                    display: "Nothing recognizable".to_string(),
                    speech: "I don't see anything I recognize.".to_string(),
                }
            }
            [a] => format!("I see a {a}."),
            [a, b] => format!("I see a {a} and a {b}."),
            [a, b, c, ..] => format!("I see a {a}, a {b}, and a {c}."),
        };

        Summary {
            display: format!("I see {}", labels.join(", ")),
            speech,
        }
    }
}
