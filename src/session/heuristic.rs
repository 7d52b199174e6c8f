//! Lexical turn-completion heuristic.
//!
//! A pure function of the accumulated transcript text. It runs before
//! the model classifier and its decision, when decisive, is final.

use std::collections::HashSet;

use once_cell::sync::Lazy;

/// Tri-state turn decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDecision {
    /// The caller has finished; respond now
    Respond,
    /// The caller is mid-thought; keep listening
    Wait,
    /// Escalate to the model classifier
    Unclear,
}

/// Trailing words that signal an unfinished sentence: fillers,
/// conjunctions, prepositions, and articles.
static TRAILING_CONTINUATION: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // fillers
        "um", "uh", "er", "ah", "hmm", "like",
        // conjunctions
        "and", "but", "or", "because", "although", "while", "if", "unless", "since", "whereas",
        // prepositions
        "to", "of", "in", "on", "at", "with", "for", "from", "by", "about", "into", "onto",
        "over", "under", "between", "through",
        // articles
        "a", "an", "the",
    ]
    .into_iter()
    .collect()
});

/// Words that open a question.
static QUESTION_LEADS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "what", "who", "whom", "whose", "where", "when", "why", "how", "which", "is", "are",
        "was", "were", "do", "does", "did", "can", "could", "would", "will", "should", "shall",
        "may", "have", "has",
    ]
    .into_iter()
    .collect()
});

/// Complete-utterance acknowledgments.
static ACKNOWLEDGMENTS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "yes",
        "yeah",
        "yep",
        "no",
        "nope",
        "sure",
        "thanks",
        "thank you",
        "got it",
        "sounds good",
        "okay thanks",
        "that's all",
        "that works",
        "perfect",
        "exactly",
    ]
    .into_iter()
    .collect()
});

/// Standalone discourse markers; alone they promise a continuation.
static DISCOURSE_MARKERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    ["so", "okay", "well", "right", "now", "anyway", "actually", "basically"]
        .into_iter()
        .collect()
});

fn normalize(transcript: &str) -> String {
    transcript
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation() || *c == '\'')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classify whether the transcript reads as a finished utterance.
///
/// Deterministic: identical input text always yields the identical
/// decision.
pub fn classify(transcript: &str) -> TurnDecision {
    let normalized = normalize(transcript);
    if normalized.is_empty() {
        return TurnDecision::Unclear;
    }
    let tokens: Vec<&str> = normalized.split(' ').collect();

    // An isolated discourse marker promises more speech
    if tokens.len() == 1 && DISCOURSE_MARKERS.contains(tokens[0]) {
        return TurnDecision::Wait;
    }

    if let Some(last) = tokens.last()
        && TRAILING_CONTINUATION.contains(last)
    {
        return TurnDecision::Wait;
    }

    if ACKNOWLEDGMENTS.contains(normalized.as_str()) {
        return TurnDecision::Respond;
    }

    if tokens.len() >= 3
        && let Some(first) = tokens.first()
        && QUESTION_LEADS.contains(first)
    {
        return TurnDecision::Respond;
    }

    TurnDecision::Unclear
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_lead_with_three_tokens_responds() {
        assert_eq!(classify("how are you"), TurnDecision::Respond);
        assert_eq!(classify("What time does it open?"), TurnDecision::Respond);
    }

    #[test]
    fn test_isolated_discourse_marker_waits() {
        assert_eq!(classify("so"), TurnDecision::Wait);
        assert_eq!(classify("well"), TurnDecision::Wait);
        assert_eq!(classify("Okay."), TurnDecision::Wait);
    }

    #[test]
    fn test_trailing_continuation_waits() {
        assert_eq!(classify("I wanted to ask you about the"), TurnDecision::Wait);
        assert_eq!(classify("can you tell me if"), TurnDecision::Wait);
        assert_eq!(classify("so I was thinking um"), TurnDecision::Wait);
    }

    #[test]
    fn test_acknowledgments_respond() {
        assert_eq!(classify("yes"), TurnDecision::Respond);
        assert_eq!(classify("thank you"), TurnDecision::Respond);
        assert_eq!(classify("sounds good"), TurnDecision::Respond);
    }

    #[test]
    fn test_otherwise_unclear() {
        assert_eq!(classify("I moved here last spring"), TurnDecision::Unclear);
        assert_eq!(classify(""), TurnDecision::Unclear);
        assert_eq!(classify("how now"), TurnDecision::Unclear);
    }

    #[test]
    fn test_pure_function_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(classify("how are you"), TurnDecision::Respond);
            assert_eq!(classify("so"), TurnDecision::Wait);
        }
    }
}
