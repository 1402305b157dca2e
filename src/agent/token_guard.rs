/// Marker appended to tool results that were cut short.
pub const TRUNCATION_MARKER: &str = "\n...[TRUNCATED]...";

/// Room kept free for the marker when truncating.
const MARKER_RESERVE: usize = 20;

/// Bounds one message's tool loop: how many rounds it may run and how
/// large a single tool result may grow in the transcript.
#[derive(Debug, Clone, Copy)]
pub struct TokenGuard {
    max_tool_rounds: usize,
    max_result_chars: usize,
}

impl TokenGuard {
    pub fn new(max_tool_rounds: usize, max_result_chars: usize) -> Self {
        Self {
            max_tool_rounds,
            max_result_chars,
        }
    }

    pub fn max_tool_rounds(&self) -> usize {
        self.max_tool_rounds
    }

    /// Whether tool round number `round` (1-based) may run.
    pub fn allow_round(&self, round: usize) -> bool {
        round <= self.max_tool_rounds
    }

    /// Cuts `result` down to the configured size, counted in chars.
    pub fn truncate_result(&self, result: String) -> String {
        if result.chars().count() <= self.max_result_chars {
            return result;
        }
        let keep = self.max_result_chars.saturating_sub(MARKER_RESERVE);
        let mut truncated: String = result.chars().take(keep).collect();
        truncated.push_str(TRUNCATION_MARKER);
        truncated
    }
}
