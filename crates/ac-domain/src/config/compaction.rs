use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compaction collapses old conversation history into a summary so the
/// context window doesn't overflow after many turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Enable auto-compact when estimated token usage crosses `threshold_ratio`
    /// of the model's context window.
    #[serde(default = "d_true")]
    pub auto: bool,
    /// Fraction of the model's context window that triggers auto-compact.
    #[serde(default = "d_09")]
    pub threshold_ratio: f64,
    /// Maximum turns (user messages) before auto-compaction triggers,
    /// independent of estimated token count.
    #[serde(default = "d_80")]
    pub max_turns: usize,
    /// Number of recent turns to keep verbatim after compaction.
    #[serde(default = "d_12")]
    pub keep_last_turns: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            threshold_ratio: 0.9,
            max_turns: 80,
            keep_last_turns: 12,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_09() -> f64 {
    0.9
}
fn d_80() -> usize {
    80
}
fn d_12() -> usize {
    12
}
