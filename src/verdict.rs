//! Sentinel-tag classification of agent output.
//!
//! Agent output is unreliable: markers arrive wrapped in markdown emphasis,
//! padded with whitespace, or alongside contradictory markers. Detection
//! therefore runs over a normalized copy of the text, and `[FAIL]` always
//! overrides `[PASS]` - a lone success marker is never trusted.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const MARKERS: [&str; 4] = ["PASS", "FAIL", "DONE", "BLOCKED"];

/// Structured reading of one agent reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// `[PASS]`: no issues found.
    Clean,
    /// `[FAIL]`: the raw text minus the marker, one finding per line.
    /// The inner structure is opaque payload for the fix prompt.
    IssuesFound { report: String },
    /// `[DONE]`: repair applied, with the marker line's trailing summary.
    Fixed { summary: String },
    /// `[BLOCKED]`: the agent cannot proceed, with its stated reason.
    Blocked { reason: String },
    /// No recognizable marker.
    Unparseable,
}

pub fn classify(text: &str) -> Verdict {
    let normalized = normalize(text);
    // Precedence: FAIL > BLOCKED > DONE > PASS.
    if has_marker(&normalized, "FAIL") {
        return Verdict::IssuesFound {
            report: strip_marker(text, "FAIL"),
        };
    }
    if has_marker(&normalized, "BLOCKED") {
        return Verdict::Blocked {
            reason: marker_line_tail(text, "BLOCKED")
                .unwrap_or_else(|| "no reason given".to_string()),
        };
    }
    if has_marker(&normalized, "DONE") {
        return Verdict::Fixed {
            summary: marker_line_tail(text, "DONE")
                .unwrap_or_else(|| "no summary given".to_string()),
        };
    }
    if has_marker(&normalized, "PASS") {
        return Verdict::Clean;
    }
    Verdict::Unparseable
}

/// Strip whitespace and emphasis punctuation so `**[ PASS ]**` and `[PASS]`
/// test identically.
fn normalize(text: &str) -> String {
    text.chars()
        .filter(|ch| !ch.is_whitespace() && !matches!(ch, '*' | '_' | '`' | '~' | '#' | '>'))
        .collect::<String>()
        .to_ascii_uppercase()
}

fn has_marker(normalized: &str, word: &str) -> bool {
    normalized.contains(&format!("[{word}]"))
}

struct MarkerPatterns {
    strip: Regex,
    line_tail: Regex,
}

/// Per-marker patterns, compiled once for the process.
fn marker_patterns(word: &str) -> &'static MarkerPatterns {
    static CACHE: OnceLock<BTreeMap<&'static str, MarkerPatterns>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| {
        MARKERS
            .iter()
            .map(|word| {
                let strip = Regex::new(&format!(
                    r"(?i)[ \t]*[*_~`]*\[\s*{word}\s*\][*_~`:]*[ \t]*"
                ))
                .unwrap();
                let line_tail =
                    Regex::new(&format!(r"(?i)\[\s*{word}\s*\]\s*:?\s*(.*)")).unwrap();
                (*word, MarkerPatterns { strip, line_tail })
            })
            .collect()
    });
    &cache[word]
}

/// Raw text with every occurrence of the marker (and surrounding emphasis)
/// removed.
fn strip_marker(text: &str, word: &str) -> String {
    let re = &marker_patterns(word).strip;
    re.replace_all(text, "").trim().to_string()
}

/// Trailing free text of the first line carrying the marker.
fn marker_line_tail(text: &str, word: &str) -> Option<String> {
    let re = &marker_patterns(word).line_tail;
    for line in text.lines() {
        if let Some(caps) = re.captures(line) {
            let tail = caps[1]
                .trim()
                .trim_matches(|ch: char| matches!(ch, '*' | '_' | '`' | '~'))
                .trim();
            if !tail.is_empty() {
                return Some(tail.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_pass() {
        assert_eq!(classify("all good\n[PASS]\n"), Verdict::Clean);
    }

    #[test]
    fn test_fail_overrides_pass() {
        let text = "[PASS]\nwait, actually\n[FAIL]\nsrc/main.rs:10 off-by-one\n";
        match classify(text) {
            Verdict::IssuesFound { report } => {
                assert!(report.contains("off-by-one"));
                assert!(!report.contains("[FAIL]"));
            }
            other => panic!("expected IssuesFound, got {other:?}"),
        }
    }

    #[test]
    fn test_markers_survive_emphasis_and_spacing() {
        assert_eq!(classify("**[ PASS ]**"), Verdict::Clean);
        assert!(matches!(
            classify("result: __[FAIL]__\nlib.rs:3 leak"),
            Verdict::IssuesFound { .. }
        ));
    }

    #[test]
    fn test_done_summary_from_marker_line() {
        match classify("edits applied\n[DONE] tightened bounds check\n") {
            Verdict::Fixed { summary } => assert_eq!(summary, "tightened bounds check"),
            other => panic!("expected Fixed, got {other:?}"),
        }
    }

    #[test]
    fn test_done_without_summary() {
        match classify("[DONE]") {
            Verdict::Fixed { summary } => assert_eq!(summary, "no summary given"),
            other => panic!("expected Fixed, got {other:?}"),
        }
    }

    #[test]
    fn test_blocked_reason() {
        match classify("[BLOCKED] repository is read-only\n") {
            Verdict::Blocked { reason } => assert_eq!(reason, "repository is read-only"),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn test_blocked_overrides_done() {
        assert!(matches!(
            classify("[DONE] partial\n[BLOCKED] cannot edit vendored file\n"),
            Verdict::Blocked { .. }
        ));
    }

    #[test]
    fn test_unparseable() {
        assert_eq!(classify("I think it looks fine?"), Verdict::Unparseable);
        assert_eq!(classify("[FAILURE] is not a marker"), Verdict::Unparseable);
    }

    #[test]
    fn test_classification_is_stable_across_repeated_calls() {
        for _ in 0..3 {
            assert!(matches!(
                classify("[FAIL]\na.rs:1 bad"),
                Verdict::IssuesFound { .. }
            ));
            assert!(matches!(classify("[BLOCKED] why"), Verdict::Blocked { .. }));
            assert!(matches!(classify("[DONE] what"), Verdict::Fixed { .. }));
            assert_eq!(classify("[PASS]"), Verdict::Clean);
        }
    }

    #[test]
    fn test_fail_report_keeps_findings() {
        let text = "[FAIL]\na.rs:1 first\nb.rs:2 second\n";
        match classify(text) {
            Verdict::IssuesFound { report } => {
                assert_eq!(report, "a.rs:1 first\nb.rs:2 second");
            }
            other => panic!("expected IssuesFound, got {other:?}"),
        }
    }
}
