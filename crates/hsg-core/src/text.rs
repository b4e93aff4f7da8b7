//! Text primitives
//!
//! Canonical tokenization, the 64-bit simhash fingerprint used for
//! near-duplicate detection, sentence/paragraph chunking, and the essence
//! extractor that condenses long content before storage.

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

// ============================================================================
// CANONICAL TOKENS
// ============================================================================

/// Minimum token length kept by canonicalization
const MIN_TOKEN_LEN: usize = 3;

static STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "with", "this", "that", "from", "have", "has",
    "had", "not", "but", "you", "your", "our", "its", "they", "them", "their", "will", "would",
    "can", "could", "should", "about", "into", "out", "all", "any", "each", "when", "what",
    "who", "how", "why", "where", "which", "been", "being", "than", "then", "there", "here",
];

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").unwrap());

/// Canonicalize a single token: lowercase, ascii-folded alphanumerics only.
pub fn canonicalize_token(tok: &str) -> String {
    tok.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Ordered canonical tokens of a text: lowercased alphanumeric runs with
/// stopwords and short tokens dropped. Order is preserved for n-gram features.
pub fn canonical_tokens(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .filter(|t| t.len() >= MIN_TOKEN_LEN && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Deduplicated canonical token set. BTreeSet keeps iteration deterministic,
/// which the simhash relies on only for reproducibility of tests.
pub fn canonical_token_set(text: &str) -> BTreeSet<String> {
    canonical_tokens(text).into_iter().collect()
}

/// Overlap ratio of query tokens found in the memory token set.
pub fn token_overlap(query_tokens: &BTreeSet<String>, mem_tokens: &BTreeSet<String>) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let hits = query_tokens.intersection(mem_tokens).count();
    hits as f64 / query_tokens.len() as f64
}

/// Most frequent canonical tokens of a text, ties broken by first occurrence.
pub fn top_keywords(text: &str, k: usize) -> Vec<String> {
    let tokens = canonical_tokens(text);
    let mut freq: HashMap<&str, (usize, usize)> = HashMap::new();
    for (pos, tok) in tokens.iter().enumerate() {
        let entry = freq.entry(tok.as_str()).or_insert((0, pos));
        entry.0 += 1;
    }
    let mut items: Vec<(&str, usize, usize)> =
        freq.into_iter().map(|(t, (c, p))| (t, c, p)).collect();
    items.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    items.into_iter().take(k).map(|(t, _, _)| t.to_string()).collect()
}

// ============================================================================
// SIMHASH
// ============================================================================

/// 64-bit simhash over the canonical token set, rendered as 16 hex chars.
///
/// Each token contributes a 32-bit rolling hash; for every virtual bit i the
/// hash's bit `i % 32` votes +1/-1. The shift-wrap at 32 is intentional and
/// part of the stored fingerprint format, so it must not be "fixed".
pub fn compute_simhash(text: &str) -> String {
    let tokens = canonical_token_set(text);

    let mut vec = [0i32; 64];
    for tok in &tokens {
        let mut h: i32 = 0;
        for c in tok.chars() {
            h = h.wrapping_shl(5).wrapping_sub(h).wrapping_add(c as i32);
        }
        for (i, slot) in vec.iter_mut().enumerate() {
            let bit = 1i32.wrapping_shl((i % 32) as u32);
            if h & bit != 0 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    }

    let mut out = String::with_capacity(16);
    for chunk in vec.chunks(4) {
        let mut nibble = 0u8;
        if chunk[0] > 0 {
            nibble += 8;
        }
        if chunk[1] > 0 {
            nibble += 4;
        }
        if chunk[2] > 0 {
            nibble += 2;
        }
        if chunk[3] > 0 {
            nibble += 1;
        }
        out.push(char::from_digit(nibble as u32, 16).unwrap_or('0'));
    }
    out
}

/// Hamming distance between two 16-hex simhash fingerprints.
pub fn hamming_distance(a: &str, b: &str) -> u32 {
    a.chars()
        .zip(b.chars())
        .map(|(ca, cb)| {
            let x = ca.to_digit(16).unwrap_or(0) ^ cb.to_digit(16).unwrap_or(0);
            x.count_ones()
        })
        .sum()
}

// ============================================================================
// CHUNKING
// ============================================================================

/// Rough chars-per-token estimate used by the chunker
const CHARS_PER_TOKEN: usize = 4;

/// A chunk of source text with its original byte offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub tokens: usize,
}

fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

static PARAGRAPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\n]+(?:\n[^\n]+)*").unwrap());
static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?]+(?:[.!?]+\s*|$)").unwrap());

/// Split text into overlapping chunks of roughly `target` tokens, cutting at
/// paragraph and sentence boundaries. `overlap` is a 0..1 fraction of the
/// chunk carried into the next one.
pub fn chunk_text(text: &str, target: usize, overlap: f64) -> Vec<Chunk> {
    let total = estimate_tokens(text);
    if total <= target {
        return vec![Chunk {
            text: text.to_string(),
            start: 0,
            end: text.len(),
            tokens: total,
        }];
    }

    let overlap_chars = ((target * CHARS_PER_TOKEN) as f64 * overlap).floor() as usize;

    // Collect sentences with their true offsets, paragraph by paragraph
    let mut sents: Vec<Chunk> = Vec::new();
    for p in PARAGRAPH_RE.find_iter(text) {
        for s in SENTENCE_RE.find_iter(p.as_str()) {
            if s.as_str().trim().is_empty() {
                continue;
            }
            sents.push(Chunk {
                text: s.as_str().to_string(),
                start: p.start() + s.start(),
                end: p.start() + s.end(),
                tokens: estimate_tokens(s.as_str()),
            });
        }
    }
    if sents.is_empty() {
        return vec![Chunk {
            text: text.to_string(),
            start: 0,
            end: text.len(),
            tokens: total,
        }];
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<Chunk> = Vec::new();
    let mut current_tokens = 0usize;

    let commit = |current: &[Chunk], current_tokens: usize, chunks: &mut Vec<Chunk>| {
        let start = current[0].start;
        let end = current[current.len() - 1].end;
        chunks.push(Chunk {
            text: text[start..end].to_string(),
            start,
            end,
            tokens: current_tokens,
        });
    };

    for s in sents {
        if current_tokens + s.tokens > target && !current.is_empty() {
            commit(&current, current_tokens, &mut chunks);

            // Carry trailing sentences into the next chunk as overlap
            let mut carried: Vec<Chunk> = Vec::new();
            let mut carried_chars = 0usize;
            for prev in current.iter().rev() {
                if carried_chars >= overlap_chars {
                    break;
                }
                carried_chars += prev.text.len();
                carried.insert(0, prev.clone());
            }
            carried.push(s);
            current_tokens = carried.iter().map(|c| c.tokens).sum();
            current = carried;
        } else {
            current_tokens += s.tokens;
            current.push(s);
        }
    }
    if !current.is_empty() {
        commit(&current, current_tokens, &mut chunks);
    }

    chunks
}

// ============================================================================
// ESSENCE EXTRACTION
// ============================================================================

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#+\s|^[A-Z][A-Z\s]+:").unwrap());
static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z][a-z]+:").unwrap());
static ISO_DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());
static MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+\d+").unwrap()
});
static QUANTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\d+|\d+\s*(miles|dollars|years|months|km)").unwrap());
static PROPER_NOUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)+").unwrap());
static ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bought|purchased|serviced|visited|went|got|received|paid|earned|learned|discovered|found|saw|met|completed|finished|fixed|implemented|created|updated|added|removed|resolved)\b").unwrap()
});
static QUESTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(who|what|when|where|why|how)\b").unwrap());
static FIRST_PERSON_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(I|my|me)\b").unwrap());

fn split_sentences(raw: &str) -> Vec<String> {
    SENTENCE_RE
        .find_iter(raw)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| s.len() > 10)
        .collect()
}

fn score_sentence(s: &str, idx: usize) -> i32 {
    let mut sc = 0;
    if idx == 0 {
        sc += 10;
    }
    if idx == 1 {
        sc += 5;
    }
    if HEADING_RE.is_match(s) {
        sc += 8;
    }
    if LABEL_RE.is_match(s) {
        sc += 6;
    }
    if ISO_DATE_RE.is_match(s) {
        sc += 7;
    }
    if MONTH_RE.is_match(s) {
        sc += 5;
    }
    if QUANTITY_RE.is_match(s) {
        sc += 4;
    }
    if PROPER_NOUN_RE.is_match(s) {
        sc += 3;
    }
    if ACTION_RE.is_match(s) {
        sc += 4;
    }
    if QUESTION_RE.is_match(s) {
        sc += 2;
    }
    if s.len() < 80 {
        sc += 2;
    }
    if FIRST_PERSON_RE.is_match(s) {
        sc += 1;
    }
    sc
}

/// Condense long content into its highest-signal sentences, keeping original
/// order and staying within `max_len` bytes. The first sentence is always
/// kept when it fits. Short content passes through untouched.
pub fn extract_essence(raw: &str, max_len: usize) -> String {
    if raw.len() <= max_len {
        return raw.to_string();
    }
    let sents = split_sentences(raw);
    if sents.is_empty() {
        let cut = raw
            .char_indices()
            .take_while(|(i, c)| i + c.len_utf8() <= max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        return raw[..cut].to_string();
    }

    let mut scored: Vec<(usize, i32)> = sents
        .iter()
        .enumerate()
        .map(|(idx, s)| (idx, score_sentence(s, idx)))
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let mut selected: Vec<usize> = Vec::new();
    let mut used = 0usize;

    // The opening sentence anchors the essence
    if sents[0].len() < max_len {
        selected.push(0);
        used += sents[0].len();
    }

    for (idx, _) in &scored {
        if *idx == 0 {
            continue;
        }
        let len = sents[*idx].len();
        if used + len + 2 <= max_len {
            selected.push(*idx);
            used += len + 2;
        }
    }

    // Every sentence can exceed the budget on pathological input (one giant
    // run-on); fall back to a plain prefix rather than an empty essence
    if selected.is_empty() {
        let cut = raw
            .char_indices()
            .take_while(|(i, c)| i + c.len_utf8() <= max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        return raw[..cut].to_string();
    }

    selected.sort_unstable();
    selected
        .iter()
        .map(|i| sents[*i].as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// TEMPORAL MARKERS
// ============================================================================

static TEMPORAL_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(today|yesterday|tomorrow|this\s+week|last\s+week|this\s+morning)\b",
        r"\b\d{4}-\d{2}-\d{2}\b",
        r"\b20\d{2}[/-]?(0[1-9]|1[0-2])[/-]?(0[1-9]|[12]\d|3[01])\b",
        r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}",
        r"(?i)\bwhat\s+(did|have)\s+(i|we)\s+(do|done)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// True when the query carries temporal intent ("yesterday", dates, "what did
/// i do"). Detection is informational; it surfaces in logs and traces.
pub fn has_temporal_markers(text: &str) -> bool {
    TEMPORAL_RES.iter().any(|re| re.is_match(text))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_tokens_drop_noise() {
        let toks = canonical_tokens("The CAT sat, and the cat ran!");
        assert_eq!(toks, vec!["cat", "sat", "cat", "ran"]);
    }

    #[test]
    fn test_simhash_deterministic_on_token_set() {
        // Same canonical token multiset => same fingerprint
        let a = compute_simhash("Paris trip in March");
        let b = compute_simhash("paris TRIP in march!");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_simhash_near_duplicates_close() {
        let a = compute_simhash("I bought a new mountain bike for the summer trails");
        let b = compute_simhash("I bought a new mountain bike for the summer trail rides");
        assert!(hamming_distance(&a, &b) <= 3);

        let c = compute_simhash("quarterly revenue projections for the finance team");
        assert!(hamming_distance(&a, &c) > 3);
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance("0000", "0000"), 0);
        assert_eq!(hamming_distance("0000", "000f"), 4);
        assert_eq!(hamming_distance("00", "03"), 2);
    }

    #[test]
    fn test_token_overlap() {
        let q: BTreeSet<String> = ["paris", "travel"].iter().map(|s| s.to_string()).collect();
        let m: BTreeSet<String> = ["paris", "trip", "march"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!((token_overlap(&q, &m) - 0.5).abs() < 1e-9);
        assert_eq!(token_overlap(&BTreeSet::new(), &m), 0.0);
    }

    #[test]
    fn test_chunk_short_text_single() {
        let chunks = chunk_text("short text.", 768, 0.1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
    }

    #[test]
    fn test_chunk_long_text_covers_input() {
        let sentence = "The quick brown fox jumps over the lazy dog again and again. ";
        let text = sentence.repeat(200);
        let chunks = chunk_text(&text, 100, 0.1);
        assert!(chunks.len() > 1);
        // First chunk starts at the beginning, last ends near the end
        assert_eq!(chunks[0].start, 0);
        assert!(chunks.last().unwrap().end >= text.trim_end().len());
        // Consecutive chunks overlap or touch
        for w in chunks.windows(2) {
            assert!(w[1].start <= w[0].end);
        }
    }

    #[test]
    fn test_extract_essence_keeps_first_sentence() {
        let long = format!(
            "Our team visited Paris on 2024-03-02. {} The trip cost 900 dollars total.",
            "Filler sentence that says very little of value here. ".repeat(20)
        );
        let essence = extract_essence(&long, 200);
        assert!(essence.len() <= 200);
        assert!(essence.starts_with("Our team visited Paris"));
        assert!(essence.contains("dollars"));
    }

    #[test]
    fn test_extract_essence_passthrough() {
        assert_eq!(extract_essence("tiny", 200), "tiny");
    }

    #[test]
    fn test_temporal_markers() {
        assert!(has_temporal_markers("what did I do yesterday"));
        assert!(has_temporal_markers("meeting on 2024-05-01"));
        assert!(has_temporal_markers("we met on March 3"));
        assert!(!has_temporal_markers("rust borrow checker rules"));
    }

    #[test]
    fn test_top_keywords() {
        let kws = top_keywords("rust rust rust memory memory engine", 2);
        assert_eq!(kws, vec!["rust", "memory"]);
    }
}
