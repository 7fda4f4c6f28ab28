use rlm_core::{Message, Role};
use tracing::debug;

/// The Controller conversation for one session.
///
/// Holds the turns sent to the Controller model, tracks an estimated token
/// count and compacts itself once it passes a fraction of the budget. The
/// first user message (metadata header and query) is pinned and survives
/// every compaction.
#[derive(Debug, Clone)]
pub struct Transcript {
    messages: Vec<Message>,
    /// Total estimated token count.
    estimated_tokens: usize,
    /// Token budget for the Controller context window.
    max_tokens: usize,
    /// Compact at this fraction of max_tokens.
    compaction_threshold: f64,
    compaction_count: u32,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(128_000)
    }
}

impl Transcript {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            estimated_tokens: 0,
            max_tokens,
            compaction_threshold: 0.75,
            compaction_count: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.compaction_threshold = threshold.clamp(0.5, 0.95);
        self
    }

    /// Append a turn, compacting if the budget threshold is crossed.
    pub fn push(&mut self, message: Message) {
        self.estimated_tokens += message.estimate_tokens();
        self.messages.push(message);
        if self.needs_compaction() {
            self.compact();
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.estimated_tokens
    }

    pub fn compaction_count(&self) -> u32 {
        self.compaction_count
    }

    /// The most recent assistant turn, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    fn threshold(&self) -> usize {
        (self.max_tokens as f64 * self.compaction_threshold) as usize
    }

    pub fn needs_compaction(&self) -> bool {
        self.estimated_tokens > self.threshold()
    }

    fn pin_count(&self) -> usize {
        self.messages
            .iter()
            .take(3)
            .position(|m| m.role == Role::User)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Replace the middle of the conversation with a truncated digest.
    /// Keeps the pinned prefix and the most recent 20% of turns (min 4).
    /// Returns the digest, or `None` if there was nothing to compact.
    pub fn compact(&mut self) -> Option<String> {
        if self.messages.len() <= 4 {
            return None;
        }

        let pin_count = self.pin_count();
        let keep_tail = (self.messages.len() / 5).max(4);
        let summarize_end = self.messages.len() - keep_tail;
        if summarize_end <= pin_count {
            return None;
        }

        let parts: Vec<String> = self.messages[pin_count..summarize_end]
            .iter()
            .map(|m| {
                let truncated: String = m.content.chars().take(500).collect();
                format!("[{}]: {}", m.role.as_str(), truncated)
            })
            .collect();

        let compacted = summarize_end - pin_count;
        let summary = format!(
            "[Compacted {} earlier messages]\n{}",
            compacted,
            parts.join("\n").chars().take(2000).collect::<String>()
        );

        let recent = self.messages.split_off(summarize_end);
        self.messages.truncate(pin_count);
        self.messages.push(Message::system(summary.clone()));
        self.messages.extend(recent);

        self.estimated_tokens = self.messages.iter().map(|m| m.estimate_tokens()).sum();
        self.compaction_count += 1;
        debug!(
            compacted,
            remaining = self.messages.len(),
            tokens = self.estimated_tokens,
            "compacted controller transcript"
        );

        Some(summary)
    }
}
