//! Trending-labels support: tokenization, date-label filtering, decay
//! scoring and label reverse lookup (§4.6).

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::types::{LabelToken, TrendingLabel};

static SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_\s]+").unwrap());

/// Date-shaped labels (e.g. "jan-2026", "2026-07-31") would otherwise
/// dominate trending results; filter them out before tokenizing.
static DATE_LIKE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        ^\d{4}-\d{1,2}(-\d{1,2})?$
        | ^\d{1,2}-\d{1,2}-\d{2,4}$
        | ^(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*-\d{2,4}$
        ",
    )
    .unwrap()
});

/// Recognize date-like labels so they're excluded from token tracking.
pub fn is_date_label(label: &str) -> bool {
    DATE_LIKE_RE.is_match(label.trim())
}

/// Split each label on hyphen/underscore/whitespace after lowercasing,
/// counting frequency across all provided labels. Empty tokens are dropped
/// and date-shaped labels are skipped entirely.
pub fn tokenize_labels(labels: &[String]) -> HashMap<String, i64> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for label in labels {
        if is_date_label(label) {
            continue;
        }
        let lower = label.to_lowercase();
        for token in SPLIT_RE.split(&lower) {
            if !token.is_empty() {
                *counts.entry(token.to_string()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Decay rate chosen so a token unused for the full window decays to ~5% of
/// its raw count (`exp(-lambda * window) = 0.05`).
fn decay_lambda(window_days: f64) -> f64 {
    if window_days <= 0.0 {
        return 0.0;
    }
    -(0.05f64.ln()) / window_days
}

/// `score = count * exp(-lambda * age_in_days)`, the "synaptic decay" shape
/// described in §4.6. The decay constant is implicit in the source and is
/// chosen here rather than guessed at a fixed value (see DESIGN.md).
pub fn decay_score(count: i64, last_seen: DateTime<Utc>, now: DateTime<Utc>, window_days: f64) -> f64 {
    let age_days = (now - last_seen).num_seconds() as f64 / 86_400.0;
    let age_days = age_days.max(0.0);
    let lambda = decay_lambda(window_days);
    count as f64 * (-lambda * age_days).exp()
}

/// Stage 1: score every token within the window, ranked descending.
pub fn score_tokens(tokens: &[LabelToken], now: DateTime<Utc>, window_days: f64) -> Vec<(String, f64)> {
    let mut scored: Vec<(String, f64)> = tokens
        .iter()
        .map(|t| (t.token.clone(), decay_score(t.count, t.last_seen, now, window_days)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Stage 2: reverse-lookup labels whose tokenization intersects the top-`k`
/// hot tokens, ranked by the best matching token's score.
pub fn match_labels_to_tokens(
    memory_labels: &[(i64, Vec<String>)],
    hot_tokens: &[(String, f64)],
    limit: usize,
) -> Vec<TrendingLabel> {
    let hot: HashMap<&str, f64> = hot_tokens.iter().map(|(t, s)| (t.as_str(), *s)).collect();

    let mut best: HashMap<String, TrendingLabel> = HashMap::new();
    for (_, labels) in memory_labels {
        for label in labels {
            if is_date_label(label) {
                continue;
            }
            let lower = label.to_lowercase();
            let mut label_best: Option<(&str, f64)> = None;
            for token in SPLIT_RE.split(&lower) {
                if token.is_empty() {
                    continue;
                }
                if let Some(&score) = hot.get(token) {
                    if label_best.map(|(_, s)| score > s).unwrap_or(true) {
                        label_best = Some((token, score));
                    }
                }
            }
            if let Some((token, score)) = label_best {
                let entry = best.entry(label.clone()).or_insert_with(|| TrendingLabel {
                    label: label.clone(),
                    count: 0,
                    token: token.to_string(),
                    score,
                });
                entry.count += 1;
                if score > entry.score {
                    entry.score = score;
                    entry.token = token.to_string();
                }
            }
        }
    }

    let mut results: Vec<TrendingLabel> = best.into_values().collect();
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn date_labels_are_recognized() {
        assert!(is_date_label("2026-07-31"));
        assert!(is_date_label("jan-2026"));
        assert!(!is_date_label("beer"));
        assert!(!is_date_label("deep-dive"));
    }

    #[test]
    fn tokenize_splits_and_lowercases() {
        let labels = vec!["Deep-Dive".to_string(), "deep_learning".to_string()];
        let tokens = tokenize_labels(&labels);
        assert_eq!(tokens.get("deep"), Some(&2));
        assert_eq!(tokens.get("dive"), Some(&1));
        assert_eq!(tokens.get("learning"), Some(&1));
    }

    #[test]
    fn tokenize_skips_date_labels() {
        let labels = vec!["2026-07-31".to_string(), "beer".to_string()];
        let tokens = tokenize_labels(&labels);
        assert!(!tokens.contains_key("2026"));
        assert_eq!(tokens.get("beer"), Some(&1));
    }

    #[test]
    fn decay_score_fades_with_age() {
        let now = Utc::now();
        let fresh = decay_score(10, now, now, 30.0);
        let stale = decay_score(10, now - Duration::days(30), now, 30.0);
        assert!(fresh > stale);
        assert!((fresh - 10.0).abs() < 0.001);
        assert!(stale < 1.0);
    }

    #[test]
    fn cold_start_returns_empty() {
        let scored = score_tokens(&[], Utc::now(), 30.0);
        assert!(scored.is_empty());
    }
}
