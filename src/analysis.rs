//! C1 — query analysis.
//!
//! Turns a raw [`Query`] into an [`Analysis`]: an intent label used to pick
//! a process template, a grammatical question type, extracted entities, a
//! resolved jurisdiction, and an ambiguity score. This is deliberately a
//! pure function over the query text plus a small set of pattern tables,
//! not a call out to an LLM — the generation runtime is an external
//! interface (see [`crate::generation`]), and analysis needs to run before
//! any plan exists to talk to one.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{Analysis, Entity, Query, Span};

fn statute_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b[A-Z]{2,6}\s?\d{1,4}(?:\.\d{1,3})?\b").unwrap())
}

fn date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap())
}

fn comparison_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s*(?:versus|vs\.?|compared to|compared with)\s*").unwrap())
}

/// Intent keyword table: first matching keyword set wins. Order matters —
/// more specific intents are listed before the generic fallback. Names
/// match the process-template table in [`crate::process`] one-for-one.
const INTENT_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "comparison",
        &["compare", "versus", "vs.", "difference between", "compared to"],
    ),
    (
        "calculation",
        &["calculate", "how much", "compute", "fee for", "cost of"],
    ),
    (
        "timeline",
        &["deadline", "how long", "timeline for", "by when", "when does"],
    ),
    (
        "procedure_query",
        &["how do i", "how to", "steps to", "process for", "procedure for"],
    ),
    (
        "recommendation",
        &["should i", "what should", "recommend", "best option", "advise"],
    ),
    (
        "explanation",
        &["why does", "why is", "explain", "reason for"],
    ),
    ("definition", &["what is", "define", "meaning of", "definition of"]),
    (
        "fact_retrieval",
        &["what are", "list", "who is", "where is", "which"],
    ),
];

const DEFAULT_INTENT: &str = "other";

/// Stateless query analyzer. Holds no fields today, but is a struct (rather
/// than free functions) so a future revision can carry compiled pattern
/// tables or jurisdiction dictionaries without changing the call sites.
#[derive(Debug, Default, Clone, Copy)]
pub struct Analyzer;

impl Analyzer {
    /// Construct an analyzer with default pattern tables.
    pub fn new() -> Self {
        Self
    }

    /// Analyze a query, extracting intent, question type, entities,
    /// jurisdiction, an ambiguity score, and a confidence in the
    /// classification itself.
    ///
    /// Returns [`Error::InvalidQuery`] for input that cannot be analyzed at
    /// all (empty or whitespace-only text).
    pub fn analyze(&self, query: &Query) -> Result<Analysis> {
        let trimmed = query.text.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidQuery("query text is empty".into()));
        }

        let lower = trimmed.to_lowercase();
        let matches: Vec<&str> = INTENT_KEYWORDS
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|kw| lower.contains(kw)))
            .map(|(intent, _)| *intent)
            .collect();
        let intent = matches
            .first()
            .map(|s| s.to_string())
            .unwrap_or_else(|| DEFAULT_INTENT.to_string());
        let confidence = classification_confidence(&matches);

        let question_type = question_type_of(&lower);

        let mut entities = Vec::new();
        for m in statute_pattern().find_iter(trimmed) {
            entities.push(Entity {
                kind: "statute".to_string(),
                text: m.as_str().to_string(),
                span: Span::new(m.start(), m.end()),
                confidence: statute_confidence(m.as_str()),
            });
        }
        for m in date_pattern().find_iter(trimmed) {
            entities.push(Entity {
                kind: "date".to_string(),
                text: m.as_str().to_string(),
                span: Span::new(m.start(), m.end()),
                confidence: DATE_ENTITY_CONFIDENCE,
            });
        }

        let jurisdiction = query.jurisdiction_hint.clone();

        let ambiguity = ambiguity_score(trimmed, &entities, jurisdiction.is_some());

        let mut parameters = BTreeMap::new();
        if let Some(statute) = entities.iter().find(|e| e.kind == "statute") {
            parameters.insert("statute".to_string(), statute.text.clone());
        }
        if let Some(jurisdiction) = &jurisdiction {
            parameters.insert("jurisdiction".to_string(), jurisdiction.clone());
        }
        if intent == "comparison" {
            let compared = extract_compared_entities(trimmed);
            if compared.len() >= 2 {
                let joined: Vec<&str> = compared.iter().map(|(text, _)| text.as_str()).collect();
                parameters.insert("compared_entities".to_string(), joined.join("|"));
                for (i, (text, span)) in compared.into_iter().enumerate() {
                    entities.push(Entity {
                        kind: format!("compared_entity_{i}"),
                        text,
                        span,
                        confidence: COMPARED_ENTITY_CONFIDENCE,
                    });
                }
            }
        }

        Ok(Analysis {
            intent,
            question_type,
            entities,
            jurisdiction,
            ambiguity,
            confidence,
            parameters,
        })
    }
}

/// Confidence in the intent classification: high when exactly one intent's
/// keywords matched, reduced when two or more tie, and low on a bare
/// fallback to [`DEFAULT_INTENT`].
fn classification_confidence(matches: &[&str]) -> f64 {
    match matches.len() {
        0 => 0.4,
        1 => 0.9,
        _ => 0.55,
    }
}

/// Grammatical question type, independent of `intent`. Leading
/// interrogatives win; a bare declarative with a comparison marker is
/// still tagged `comparison` even without a leading "what"/"how".
fn question_type_of(lower: &str) -> String {
    const LEADING: &[(&str, &str)] = &[
        ("what", "what"),
        ("who", "who"),
        ("where", "where"),
        ("when", "when"),
        ("how", "how"),
        ("why", "why"),
    ];
    for (prefix, label) in LEADING {
        if lower.starts_with(prefix) {
            return label.to_string();
        }
    }
    const YES_NO_LEADS: &[&str] = &[
        "is ", "are ", "does ", "do ", "can ", "could ", "will ", "should ",
    ];
    if YES_NO_LEADS.iter().any(|lead| lower.starts_with(lead)) {
        return "yes_no".to_string();
    }
    if comparison_separator().is_match(lower) || lower.contains("compare") {
        return "comparison".to_string();
    }
    "statement".to_string()
}

/// Confidence assigned to a regex-matched statute reference: higher when
/// the match carries a section-number decimal (e.g. `"4.1"`), since a bare
/// abbreviation plus a short number is a looser match against the pattern.
fn statute_confidence(matched: &str) -> f64 {
    if matched.contains('.') {
        0.9
    } else {
        0.7
    }
}

/// `date_pattern` only matches a fully-formed `YYYY-MM-DD` string, so every
/// hit is treated as equally reliable.
const DATE_ENTITY_CONFIDENCE: f64 = 0.95;

/// Compared-entity extraction is a heuristic split-and-trim, not a direct
/// pattern match, so it carries a lower confidence than the regex-derived
/// entity kinds above.
const COMPARED_ENTITY_CONFIDENCE: f64 = 0.6;

/// Splits a comparison query on its separator ("versus", "vs.", "compared
/// to", ...) and trims leading filler words (`"compare"`, `"the"`, ...)
/// from each side, returning the entities being compared along with their
/// source span.
fn extract_compared_entities(trimmed: &str) -> Vec<(String, Span)> {
    let separators: Vec<regex::Match<'_>> = comparison_separator().find_iter(trimmed).collect();
    if separators.is_empty() {
        return Vec::new();
    }

    let mut sides: Vec<(usize, usize)> = Vec::new();
    let mut cursor = 0;
    for sep in &separators {
        sides.push((cursor, sep.start()));
        cursor = sep.end();
    }
    sides.push((cursor, trimmed.len()));

    sides
        .into_iter()
        .filter_map(|(start, end)| {
            let raw = &trimmed[start..end];
            let cleaned = clean_entity_phrase(raw);
            if cleaned.is_empty() {
                return None;
            }
            let offset = raw.find(cleaned.as_str()).unwrap_or(0);
            let span_start = start + offset;
            Some((cleaned.clone(), Span::new(span_start, span_start + cleaned.len())))
        })
        .collect()
}

fn clean_entity_phrase(raw: &str) -> String {
    let mut phrase = raw.trim().trim_end_matches(['?', '.', '!']).to_string();
    for filler in [
        "compare",
        "comparison of",
        "difference between",
        "the difference between",
    ] {
        if phrase.to_lowercase().starts_with(filler) {
            phrase = phrase[filler.len()..].trim().to_string();
        }
    }
    phrase
}

/// Heuristic ambiguity score: shorter queries with fewer grounded entities
/// and no jurisdiction are treated as more ambiguous. Clamped to `[0, 1]`.
fn ambiguity_score(text: &str, entities: &[Entity], has_jurisdiction: bool) -> f64 {
    let word_count = text.split_whitespace().count() as f64;
    let mut score = 1.0 - (word_count / 20.0).min(1.0) * 0.5;
    score -= (entities.len() as f64) * 0.15;
    if has_jurisdiction {
        score -= 0.2;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_query() {
        let analyzer = Analyzer::new();
        let err = analyzer.analyze(&Query::new("   ")).unwrap_err();
        assert!(matches!(err, Error::InvalidQuery(_)));
    }

    #[test]
    fn extracts_statute_entity() {
        let analyzer = Analyzer::new();
        let analysis = analyzer
            .analyze(&Query::new("What are the requirements under BImSchG 4.1?"))
            .unwrap();
        assert!(analysis.entities.iter().any(|e| e.kind == "statute"));
    }

    #[test]
    fn classifies_comparison_intent() {
        let analyzer = Analyzer::new();
        let analysis = analyzer
            .analyze(&Query::new("Compare permit requirements versus the prior rule"))
            .unwrap();
        assert_eq!(analysis.intent, "comparison");
        assert_eq!(analysis.question_type, "comparison");
    }

    #[test]
    fn comparison_intent_extracts_compared_entities() {
        let analyzer = Analyzer::new();
        let analysis = analyzer
            .analyze(&Query::new("permit requirements versus the prior rule"))
            .unwrap();
        let compared = analysis.parameters.get("compared_entities").unwrap();
        assert_eq!(compared, "permit requirements|the prior rule");
    }

    #[test]
    fn what_question_is_tagged_with_a_matching_question_type() {
        let analyzer = Analyzer::new();
        let analysis = analyzer
            .analyze(&Query::new("What is the filing fee for a building permit?"))
            .unwrap();
        assert_eq!(analysis.question_type, "what");
    }

    #[test]
    fn unmatched_intent_falls_back_with_low_confidence() {
        let analyzer = Analyzer::new();
        let analysis = analyzer.analyze(&Query::new("permits?")).unwrap();
        assert_eq!(analysis.intent, "other");
        assert!(analysis.confidence < 0.5);
    }

    #[test]
    fn short_vague_query_is_ambiguous() {
        let analyzer = Analyzer::new();
        let analysis = analyzer.analyze(&Query::new("permits?")).unwrap();
        assert!(analysis.is_ambiguous(0.5));
    }

    #[test]
    fn detailed_query_with_jurisdiction_is_not_ambiguous() {
        let analyzer = Analyzer::new();
        let mut query = Query::new(
            "What filing deadline applies under BImSchG 4.1 for an expansion permit \
             application submitted after 2024-01-01?",
        );
        query.jurisdiction_hint = Some("Bavaria".to_string());
        let analysis = analyzer.analyze(&query).unwrap();
        assert!(!analysis.is_ambiguous(0.5));
    }
}
