//! Conversation filters
//!
//! Small, independently testable predicates used by the turn orchestrator and
//! the audio pipeline: greeting detection, low-information transcript
//! filtering, reply de-duplication and message-id idempotency.

use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::time::Instant;

const GREETING_MAX_WORDS: usize = 8;

static GREETING: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(hi|hello|hey|hiya|howdy|yo|greetings|good\s+(morning|afternoon|evening|day))\b",
    )
    .ok()
});

/// Transcription artefacts commonly produced from silence or background media.
pub const DEFAULT_NOISE_PATTERNS: &[&str] = &[
    r"(?i)^\W*$",
    r"(?i)^\W*(uh+|um+|hm+|ah+|mm+)\W*$",
    r"(?i)thanks?( you)? (so much )?for watching",
    r"(?i)(please )?(like and )?subscribe",
    r"(?i)don'?t forget to (like|subscribe|comment)",
    r"(?i)subtitles? (by|provided by)",
    r"(?i)amara\.org",
    r"(?i)see you (in the )?next (video|episode|time)",
    r"(?i)hit the (bell|notification)",
];

/// Returns true for short utterances that open with a salutation.
pub fn is_greeting(text: &str) -> bool {
    let Some(pattern) = GREETING.as_ref() else {
        return false;
    };
    text.split_whitespace().count() <= GREETING_MAX_WORDS && pattern.is_match(text)
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Rejects transcripts matching a denylist of low-information patterns.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    patterns: Vec<Regex>,
}

impl NoiseFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn with_defaults() -> Self {
        Self {
            patterns: DEFAULT_NOISE_PATTERNS
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_low_information(&self, text: &str) -> bool {
        let trimmed = text.trim();
        trimmed.is_empty() || self.patterns.iter().any(|p| p.is_match(trimmed))
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Suppresses repeated greetings and replies re-sent within a short window.
///
/// Both windows are configuration; they are tuned empirically.
#[derive(Debug, Clone)]
pub struct ReplyGuard {
    greeting_cooldown: Duration,
    duplicate_window: Duration,
    last_reply: Option<(String, Instant)>,
    last_greeting: Option<Instant>,
}

impl ReplyGuard {
    pub fn new(greeting_cooldown: Duration, duplicate_window: Duration) -> Self {
        Self {
            greeting_cooldown,
            duplicate_window,
            last_reply: None,
            last_greeting: None,
        }
    }

    pub fn last_greeting(&self) -> Option<Instant> {
        self.last_greeting
    }

    /// True when a greeting was answered within the cooldown.
    pub fn should_suppress_greeting(&self, now: Instant) -> bool {
        self.last_greeting
            .is_some_and(|at| now.saturating_duration_since(at) < self.greeting_cooldown)
    }

    /// True when `reply` repeats the previous reply, or repeats a greeting,
    /// inside the duplicate window.
    pub fn is_duplicate_reply(&self, reply: &str, now: Instant) -> bool {
        let within = |at: Instant| now.saturating_duration_since(at) < self.duplicate_window;
        let exact = self
            .last_reply
            .as_ref()
            .is_some_and(|(last, at)| within(*at) && *last == normalize(reply));
        let greeting = is_greeting(reply) && self.last_greeting.is_some_and(within);
        exact || greeting
    }

    pub fn record_reply(&mut self, reply: &str, answered_greeting: bool, now: Instant) {
        self.last_reply = Some((normalize(reply), now));
        if answered_greeting || is_greeting(reply) {
            self.last_greeting = Some(now);
        }
    }
}

/// Bounded set of recently processed message ids; oldest evicted first.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Records `id`, returning false if it was already inside the window.
    pub fn check_and_insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
