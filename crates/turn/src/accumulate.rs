//! Adaptive accumulation — deciding how long to wait for more input
//! before a turn starts processing.
//!
//! The wait is computed from several signals: channel characteristics,
//! the shape of the latest message, explicit completion markers, the
//! user's learned typing cadence, and hints the Brain produced at the
//! end of the previous turn.  The computation is deterministic and does
//! no I/O, so the accumulate workflow step stays replayable.

use regex::Regex;
use serde::{Deserialize, Serialize};

use acf_domain::config::AccumulationConfig;

/// Single greeting words/phrases that usually precede the real request.
const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "hiya",
    "good morning",
    "good afternoon",
    "good evening",
    "morning",
    "afternoon",
    "evening",
];

/// Trailing tokens that signal the user considers the input complete.
const POLITE_CLOSERS: &[&str] = &["please", "thanks", "thank you"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signal types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classification of a single message's completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageShape {
    GreetingOnly,
    Fragment,
    IncompleteEntity,
    PossiblyIncomplete,
    LikelyComplete,
}

impl MessageShape {
    /// Wait adjustment in milliseconds for this shape.
    fn adjustment_ms(self) -> i64 {
        match self {
            Self::GreetingOnly => 500,
            Self::Fragment => 400,
            Self::IncompleteEntity => 600,
            Self::PossiblyIncomplete => 200,
            Self::LikelyComplete => 0,
        }
    }
}

/// Hint from the Brain to the *next* turn's accumulation step.
///
/// Stored per session at turn completion and loaded by the next turn,
/// which avoids a circular dependency between the Brain and the fabric.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccumulationHint {
    /// Extend the window significantly: the Brain asked a question and
    /// awaits the answer.
    #[serde(default)]
    pub awaiting_required_field: bool,
    /// Extend moderately: a multi-part reply is likely.
    #[serde(default)]
    pub expects_followup: bool,
    /// The Brain's guess that the input was already complete (0..1).
    #[serde(default)]
    pub input_complete_confidence: f64,
    /// What the Brain is waiting for (`order_number`, `confirmation`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_input_type: Option<String>,
}

/// Historical typing statistics for one interlocutor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UserCadenceStats {
    /// Median time between messages.
    pub inter_message_p50_ms: u64,
    /// 95th percentile.
    pub inter_message_p95_ms: u64,
    pub sample_count: u32,
}

impl UserCadenceStats {
    /// Stats are only trusted once enough samples exist.
    pub const MIN_SAMPLES: u32 = 5;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Computes the accumulation wait for a turn.
pub struct TurnManager {
    config: AccumulationConfig,
    /// Matches a dangling entity reference like `order #` or `ticket`.
    entity_tail: Regex,
}

impl TurnManager {
    pub fn new(config: AccumulationConfig) -> Self {
        Self {
            config,
            entity_tail: Regex::new(r"(order|ticket|case|id)\s*#?\s*$")
                .expect("entity tail pattern is valid"),
        }
    }

    /// How long to wait (ms) for additional messages before processing.
    ///
    /// Returns 0 for channels that never accumulate (email, voice,
    /// api); for every other channel the result is clamped to
    /// `[min_wait_ms, max_wait_ms]`.
    pub fn suggest_wait_ms(
        &self,
        message_content: &str,
        channel: &str,
        user_cadence: Option<&UserCadenceStats>,
        previous_hint: Option<&AccumulationHint>,
        messages_in_turn: usize,
    ) -> u64 {
        let channel_base = self.config.channel_default(channel);
        if channel_base == 0 {
            // Messages on these channels are always complete.
            return 0;
        }

        let mut base = channel_base as i64;

        // Message shape.
        base += self.classify_shape(message_content).adjustment_ms();

        // Explicit completion markers shorten the wait.
        if has_explicit_completion(message_content) {
            base = (base - 300).max(self.config.min_wait_ms as i64);
        }

        // Blend with the user's historical cadence once trustworthy.
        if let Some(stats) = user_cadence {
            if stats.sample_count >= UserCadenceStats::MIN_SAMPLES {
                let user_typical =
                    (stats.inter_message_p50_ms + stats.inter_message_p95_ms) as f64 / 2.0;
                base = (base as f64 * 0.6 + user_typical * 0.4).round() as i64;
            }
        }

        // Hint from the previous turn's Brain result.
        base += hint_adjustment_ms(previous_hint);

        // Diminishing returns: each already-absorbed message means the
        // user is clearly typing, so shrink the window.
        if messages_in_turn > 1 {
            base = (base as f64 * 0.8f64.powi(messages_in_turn as i32 - 1)) as i64;
        }

        base.clamp(self.config.min_wait_ms as i64, self.config.max_wait_ms as i64) as u64
    }

    /// Classify a message's completeness.  Case-insensitive; fragment
    /// and entity patterns operate on the stripped text.
    pub fn classify_shape(&self, text: &str) -> MessageShape {
        let stripped = text.trim();
        let lower = stripped.to_lowercase();

        if GREETINGS.contains(&lower.as_str()) {
            return MessageShape::GreetingOnly;
        }

        if stripped.ends_with("...")
            || stripped.ends_with(',')
            || stripped.ends_with('-')
            || stripped.ends_with(':')
        {
            return MessageShape::Fragment;
        }

        if self.entity_tail.is_match(&lower) {
            return MessageShape::IncompleteEntity;
        }

        if stripped.split_whitespace().count() < 3 && !has_explicit_completion(stripped) {
            return MessageShape::PossiblyIncomplete;
        }

        MessageShape::LikelyComplete
    }
}

/// Whether the text carries an explicit "I'm done" marker: terminal
/// punctuation or a trailing polite token.
fn has_explicit_completion(text: &str) -> bool {
    let stripped = text.trim();
    if stripped.ends_with('.') || stripped.ends_with('?') || stripped.ends_with('!') {
        return true;
    }
    let lower = stripped.to_lowercase();
    POLITE_CLOSERS.iter().any(|t| lower.ends_with(t))
}

/// First matching hint rule wins.
fn hint_adjustment_ms(hint: Option<&AccumulationHint>) -> i64 {
    let Some(hint) = hint else { return 0 };

    if hint.awaiting_required_field {
        1000
    } else if hint.expects_followup {
        500
    } else if hint.input_complete_confidence > 0.8 {
        -200
    } else {
        0
    }
}
