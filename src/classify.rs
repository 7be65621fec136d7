//! Risk verdict extraction from free-form model output.
//!
//! The upstream model answers in whatever shape it feels like: chain-of-thought
//! inside `<think>` tags, a `\boxed{...}` answer, a `**Final Answer:**`
//! section, or plain text. No single pattern is reliable alone, so the chain
//! below tries an ordered list of extractors and classifies the first region
//! that yields a marker. Order matters: permissive stages would mis-fire on
//! chain-of-thought scratch text if tried first.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Final classification of a piece of analyzed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Risky,
    Safe,
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Risky => "risky",
            Verdict::Safe => "safe",
            Verdict::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "risky" => Some(Verdict::Risky),
            "safe" => Some(Verdict::Safe),
            "unknown" => Some(Verdict::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running the extraction chain, including which stage matched.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub verdict: Verdict,
    pub confidence: f64,
    pub stage: &'static str,
}

/// Negative markers are checked before affirmative ones at every stage:
/// the affirmative Thai forms are substrings of their negations
/// ("ผิด" inside "ไม่ผิด", "ใช่" inside "ไม่ใช่").
const NEGATIVE_MARKERS: &[&str] = &["ไม่ผิด", "ไม่ใช่", "ไม่เข้าข่าย", "safe"];
const AFFIRMATIVE_MARKERS: &[&str] = &["เข้าข่ายผิด", "ผิด", "ใช่", "risky"];

fn boxed_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\boxed\{([^}]*)\}").unwrap())
}

fn final_answer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\*\*final answer:?\*\*:?\s*(.+)").unwrap())
}

fn bare_keyword_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(yes|no)\b").unwrap())
}

/// Classify a candidate text region by marker phrases.
fn marker_verdict(text: &str) -> Option<Verdict> {
    let lowered = text.to_lowercase();
    if NEGATIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some(Verdict::Safe);
    }
    if AFFIRMATIVE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some(Verdict::Risky);
    }
    None
}

/// Classify an extracted answer region (boxed contents, final-answer
/// section): marker phrases first, then bare yes/no.
fn region_verdict(text: &str) -> Option<Verdict> {
    marker_verdict(text).or_else(|| keyword_verdict(text))
}

fn keyword_verdict(text: &str) -> Option<Verdict> {
    let caps = bare_keyword_pattern().captures(text)?;
    let keyword = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    if keyword.eq_ignore_ascii_case("no") {
        Some(Verdict::Safe)
    } else {
        Some(Verdict::Risky)
    }
}

/// True when the trimmed response is exactly one marker phrase, which the
/// worker's own heuristic treats as a high-confidence answer.
fn is_exact_marker(text: &str) -> bool {
    let trimmed = text.trim().to_lowercase();
    NEGATIVE_MARKERS
        .iter()
        .chain(AFFIRMATIVE_MARKERS.iter())
        .any(|m| trimmed == *m)
}

/// Run the ordered extraction chain over a raw model response.
///
/// Stages, each attempted only when the prior stage found no match:
/// 1. text after a `</think>` tag (when a think block is present)
/// 2. the whole text (when no think block is present)
/// 3. contents of `\boxed{...}`
/// 4. the `**Final Answer:**` section
/// 5. bare yes/no keywords
/// 6. `Unknown`
pub fn classify_response(raw: &str) -> Classification {
    if let Some(idx) = raw.find("</think>") {
        let tail = &raw[idx + "</think>".len()..];
        if let Some(verdict) = marker_verdict(tail) {
            return found("think_tail", verdict, tail);
        }
    } else if let Some(verdict) = marker_verdict(raw) {
        return found("full_text", verdict, raw);
    }

    if let Some(caps) = boxed_pattern().captures(raw) {
        let inner = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if let Some(verdict) = region_verdict(inner) {
            return found("boxed", verdict, inner);
        }
    }

    if let Some(caps) = final_answer_pattern().captures(raw) {
        let section = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if let Some(verdict) = region_verdict(section) {
            return found("final_answer", verdict, section);
        }
    }

    if let Some(verdict) = keyword_verdict(raw) {
        return Classification {
            verdict,
            confidence: 0.6,
            stage: "bare_keyword",
        };
    }

    Classification {
        verdict: Verdict::Unknown,
        confidence: 0.5,
        stage: "exhausted",
    }
}

fn found(stage: &'static str, verdict: Verdict, region: &str) -> Classification {
    let confidence = if is_exact_marker(region) { 0.95 } else { 0.8 };
    Classification {
        verdict,
        confidence,
        stage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_block_tail_is_classified() {
        let c = classify_response("<think>is this gambling? maybe ไม่ผิด...</think> เข้าข่ายผิด");
        assert_eq!(c.verdict, Verdict::Risky);
        assert_eq!(c.stage, "think_tail");
    }

    #[test]
    fn plain_negative_marker() {
        let c = classify_response("ไม่ผิด");
        assert_eq!(c.verdict, Verdict::Safe);
        assert_eq!(c.stage, "full_text");
        assert_eq!(c.confidence, 0.95);
    }

    #[test]
    fn negative_checked_before_affirmative() {
        // "ผิด" is a substring of "ไม่ผิด"; the negation must win.
        assert_eq!(classify_response("ตอบ: ไม่ผิด").verdict, Verdict::Safe);
        assert_eq!(classify_response("ตอบ: ผิด").verdict, Verdict::Risky);
    }

    #[test]
    fn boxed_answer() {
        let c = classify_response(r"\boxed{ใช่}");
        assert_eq!(c.verdict, Verdict::Risky);
    }

    #[test]
    fn boxed_reached_when_tail_has_no_markers() {
        let c = classify_response("<think>scratch text ผิด ผิด</think>\nworking it out\n\\boxed{No}");
        assert_eq!(c.verdict, Verdict::Safe);
        assert_eq!(c.stage, "boxed");
    }

    #[test]
    fn final_answer_reached_without_markers() {
        let c = classify_response("Let me reason about this.\n**Final Answer:** Yes");
        assert_eq!(c.verdict, Verdict::Risky);
        assert_eq!(c.stage, "final_answer");
    }

    #[test]
    fn final_answer_section() {
        let c = classify_response("**Final Answer:** ไม่ใช่");
        assert_eq!(c.verdict, Verdict::Safe);
    }

    #[test]
    fn bare_keyword_fallback() {
        let c = classify_response("<think>hmm</think> the answer would be no");
        assert_eq!(c.verdict, Verdict::Safe);
        assert_eq!(c.stage, "bare_keyword");
    }

    #[test]
    fn unrelated_text_is_unknown() {
        let c = classify_response("completely unrelated text");
        assert_eq!(c.verdict, Verdict::Unknown);
        assert_eq!(c.stage, "exhausted");
    }

    #[test]
    fn think_scratch_text_does_not_leak() {
        // Markers inside the think block must not influence the verdict.
        let c = classify_response("<think>อันนี้ผิดแน่ๆ</think> completely unrelated");
        assert_eq!(c.verdict, Verdict::Unknown);
    }

    #[test]
    fn worker_fallback_labels() {
        assert_eq!(classify_response("RISKY").verdict, Verdict::Risky);
        assert_eq!(classify_response("SAFE").verdict, Verdict::Safe);
    }

    #[test]
    fn verdict_round_trips_as_str() {
        for v in [Verdict::Risky, Verdict::Safe, Verdict::Unknown] {
            assert_eq!(Verdict::parse(v.as_str()), Some(v));
        }
    }
}
