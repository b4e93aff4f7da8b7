//! Regex pattern bank
//!
//! Each sector owns a list of cue patterns; a match contributes
//! `count x sector_weight` to that sector's score. The argmax wins, sectors
//! within 30% of the winner ride along as additional sectors, and metadata
//! can force the primary outright.

use crate::types::Sector;
use regex::Regex;
use std::sync::LazyLock;

/// Result of classifying a piece of content or a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub primary: Sector,
    pub additional: Vec<Sector>,
    pub confidence: f64,
    /// True when metadata pinned the primary sector
    pub forced: bool,
}

fn bank(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
}

static EPISODIC: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    bank(&[
        r"(?i)\b(today|yesterday|tomorrow|last\s+(week|month|year)|next\s+(week|month|year))\b",
        r"(?i)\b(remember\s+when|recall|that\s+time|when\s+I|I\s+was|we\s+were)\b",
        r"(?i)\b(went|saw|met|felt|heard|visited|attended|participated)\b",
        r"(?i)\b(at\s+\d{1,2}:\d{2}|on\s+(monday|tuesday|wednesday|thursday|friday|saturday|sunday))\b",
        r"(?i)\b(event|moment|experience|incident|occurrence|happened)\b",
        r"(?i)\bI\s+'?m\s+going\s+to\b",
    ])
});

static SEMANTIC: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    bank(&[
        r"(?i)\b(is\s+a|represents|means|stands\s+for|defined\s+as)\b",
        r"(?i)\b(concept|theory|principle|law|hypothesis|theorem|axiom)\b",
        r"(?i)\b(fact|statistic|data|evidence|proof|research|study|report)\b",
        r"(?i)\b(capital|population|distance|weight|height|width|depth)\b",
        r"(?i)\b(history|science|geography|math|physics|biology|chemistry)\b",
        r"(?i)\b(know|understand|learn|read|write|speak)\b",
    ])
});

static PROCEDURAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    bank(&[
        r"(?i)\b(how\s+to|step\s+by\s+step|guide|tutorial|manual|instructions)\b",
        r"(?i)\b(first|second|then|next|finally|afterwards|lastly)\b",
        r"(?i)\b(install|run|execute|compile|build|deploy|configure|setup)\b",
        r"(?i)\b(click|press|type|enter|select|drag|drop|scroll)\b",
        r"(?i)\b(method|function|class|algorithm|routine|recipe)\b",
        r"(?i)\b(to\s+do|to\s+make|to\s+build|to\s+create)\b",
    ])
});

static EMOTIONAL: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    bank(&[
        r"(?i)\b(feel|feeling|felt|emotions?|mood|vibe)\b",
        r"(?i)\b(happy|sad|angry|mad|excited|scared|anxious|nervous|depressed)\b",
        r"(?i)\b(love|hate|like|dislike|adore|detest|enjoy|loathe)\b",
        r"(?i)\b(amazing|terrible|awesome|awful|wonderful|horrible|great|bad)\b",
        r"(?i)\b(frustrated|confused|overwhelmed|stressed|relaxed|calm)\b",
        r"(?i)\b(wow|omg|yay|nooo|ugh|sigh)\b",
        r"[!]{2,}",
    ])
});

static REFLECTIVE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    bank(&[
        r"(?i)\b(realize|realized|realization|insight|epiphany)\b",
        r"(?i)\b(think|thought|thinking|ponder|contemplate|reflect)\b",
        r"(?i)\b(understand|understood|understanding|grasp|comprehend)\b",
        r"(?i)\b(pattern|trend|connection|link|relationship|correlation)\b",
        r"(?i)\b(lesson|moral|takeaway|conclusion|summary|implication)\b",
        r"(?i)\b(feedback|review|analysis|evaluation|assessment)\b",
        r"(?i)\b(improve|grow|change|adapt|evolve)\b",
    ])
});

fn sector_bank(sector: Sector) -> &'static [Regex] {
    match sector {
        Sector::Episodic => &EPISODIC,
        Sector::Semantic => &SEMANTIC,
        Sector::Procedural => &PROCEDURAL,
        Sector::Emotional => &EMOTIONAL,
        Sector::Reflective => &REFLECTIVE,
    }
}

/// Sector forced by metadata, when present and valid.
fn forced_sector(metadata: Option<&serde_json::Map<String, serde_json::Value>>) -> Option<Sector> {
    let meta = metadata?;
    let name = meta
        .get("primary_sector")
        .or_else(|| meta.get("sector"))
        .and_then(|v| v.as_str())?;
    // Only accept names from the closed set; parse_name would silently map
    // junk to semantic, which is not a force.
    Sector::ALL.iter().copied().find(|s| s.as_str() == name)
}

/// Classify content into a primary sector plus additional sectors.
///
/// Scores are `match_count x sector_weight` summed over the sector's
/// patterns. Additional sectors need a nonzero score within 30% of the
/// winner. When nothing matches the content defaults to semantic with low
/// confidence.
pub fn classify_content(
    content: &str,
    metadata: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Classification {
    let forced = forced_sector(metadata);

    let mut scores: Vec<(Sector, f64)> = Sector::ALL
        .iter()
        .map(|&sector| {
            let weight = sector.weight() as f64;
            let score: f64 = sector_bank(sector)
                .iter()
                .map(|re| re.find_iter(content).count() as f64 * weight)
                .sum();
            (sector, score)
        })
        .collect();
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (top, top_score) = scores[0];
    let second_score = scores[1].1;
    let threshold = (top_score * 0.3).max(1.0);

    let primary = forced.unwrap_or(if top_score > 0.0 { top } else { Sector::Semantic });
    // The primary filters itself out, so when metadata forces a different
    // sector the organically-winning one is kept as additional.
    let additional: Vec<Sector> = scores
        .iter()
        .filter(|(s, sc)| *s != primary && *sc > 0.0 && *sc >= threshold)
        .map(|(s, _)| *s)
        .collect();

    let confidence = if forced.is_some() {
        1.0
    } else if top_score > 0.0 {
        (top_score / (top_score + second_score + 1.0)).min(1.0)
    } else {
        0.2
    };

    Classification {
        primary,
        additional,
        confidence,
        forced: forced.is_some(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episodic_classification() {
        let c = classify_content(
            "I went to Paris yesterday and loved the Eiffel Tower",
            None,
        );
        assert_eq!(c.primary, Sector::Episodic);
        assert!(c.confidence > 0.2);
    }

    #[test]
    fn test_procedural_classification() {
        let c = classify_content(
            "How to deploy: first install the toolchain, then run the build step by step",
            None,
        );
        assert_eq!(c.primary, Sector::Procedural);
    }

    #[test]
    fn test_emotional_classification() {
        let c = classify_content("I feel so excited and happy about this, wow!!", None);
        assert_eq!(c.primary, Sector::Emotional);
    }

    #[test]
    fn test_default_semantic_on_no_match() {
        let c = classify_content("zzz qqq", None);
        assert_eq!(c.primary, Sector::Semantic);
        assert!((c.confidence - 0.2).abs() < 1e-9);
        assert!(c.additional.is_empty());
    }

    #[test]
    fn test_metadata_forces_sector() {
        let meta: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"sector": "procedural"}"#).unwrap();
        let c = classify_content("I went to Paris yesterday", Some(&meta));
        assert_eq!(c.primary, Sector::Procedural);
        assert!(c.forced);
        assert_eq!(c.confidence, 1.0);
        // The organically-scored sector survives as an additional one
        assert!(c.additional.contains(&Sector::Episodic));
    }

    #[test]
    fn test_invalid_forced_sector_ignored() {
        let meta: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"sector": "bogus"}"#).unwrap();
        let c = classify_content("I went to Paris yesterday", Some(&meta));
        assert!(!c.forced);
        assert_eq!(c.primary, Sector::Episodic);
    }

    #[test]
    fn test_additional_sectors_within_threshold() {
        // Strong episodic plus milder emotional signal
        let c = classify_content(
            "Yesterday I went to the concert downtown and met some friends, I felt happy",
            None,
        );
        assert_eq!(c.primary, Sector::Episodic);
        assert!(c.additional.contains(&Sector::Emotional));
    }
}
