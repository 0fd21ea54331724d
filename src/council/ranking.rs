//! Parsing ranker output and aggregating rankings across rankers.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use super::labels::LabelMap;
use super::types::{AggregateEntry, AggregateRanking, RankingEntry, RankingResponse};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RankingParseError {
    #[error("no ranking found in response")]
    Unparseable,
    #[error("unknown label {0}")]
    UnknownLabel(String),
    #[error("label {0} ranked more than once")]
    DuplicateLabel(String),
    #[error("ranking covers {got} of {expected} labels")]
    Incomplete { got: usize, expected: usize },
    #[error("rank {rank} for label {label} outside 1..={max}")]
    RankOutOfRange { label: String, rank: u32, max: u32 },
}

#[derive(Deserialize)]
struct RankingJson {
    ranking: Vec<RankingJsonEntry>,
}

#[derive(Deserialize)]
struct RankingJsonEntry {
    label: String,
    rank: u32,
    #[serde(default)]
    justification: Option<String>,
}

/// Parse a ranker's reply into one entry per label.
///
/// Accepts `{"ranking":[{"label":"A","rank":1,"justification":"..."}]}`
/// anywhere in the text, or a numbered list after a `FINAL RANKING:` line.
/// The result must rank every label exactly once.
pub fn parse_ranking(
    raw: &str,
    labels: &LabelMap,
) -> Result<Vec<RankingEntry>, RankingParseError> {
    let entries = parse_json(raw)
        .or_else(|| parse_numbered_list(raw))
        .ok_or(RankingParseError::Unparseable)?;
    validate(entries, labels)
}

/// First balanced `{...}` in the text that deserializes as a ranking. Stray
/// braces in surrounding prose are skipped.
fn parse_json(raw: &str) -> Option<Vec<RankingEntry>> {
    let parsed = raw
        .match_indices('{')
        .filter_map(|(start, _)| balanced_object(&raw[start..]))
        .find_map(|json| serde_json::from_str::<RankingJson>(json).ok())?;
    Some(
        parsed
            .ranking
            .into_iter()
            .map(|e| RankingEntry {
                label: normalize_label(&e.label),
                rank: e.rank,
                justification: e.justification.filter(|j| !j.trim().is_empty()),
            })
            .collect(),
    )
}

fn numbered_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^\s*(\d+)[.):]\s*(?:response\s+)?([A-Z]{1,3})\b")
            .unwrap_or_else(|e| panic!("invalid ranking regex: {e}"))
    })
}

fn parse_numbered_list(raw: &str) -> Option<Vec<RankingEntry>> {
    let upper = raw.to_ascii_uppercase();
    let start = upper.rfind("FINAL RANKING")?;
    let section = &raw[start..];

    let entries: Vec<RankingEntry> = numbered_line_re()
        .captures_iter(section)
        .filter_map(|caps| {
            let rank = caps.get(1)?.as_str().parse().ok()?;
            Some(RankingEntry {
                label: normalize_label(caps.get(2)?.as_str()),
                rank,
                justification: None,
            })
        })
        .collect();

    (!entries.is_empty()).then_some(entries)
}

fn normalize_label(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .get(..9)
        .filter(|p| p.eq_ignore_ascii_case("response "))
        .map(|_| &trimmed[9..])
        .unwrap_or(trimmed);
    stripped.trim().to_ascii_uppercase()
}

fn validate(
    entries: Vec<RankingEntry>,
    labels: &LabelMap,
) -> Result<Vec<RankingEntry>, RankingParseError> {
    let max = labels.len() as u32;
    let mut seen = HashSet::new();

    for entry in &entries {
        if labels.get(&entry.label).is_none() {
            return Err(RankingParseError::UnknownLabel(entry.label.clone()));
        }
        if !seen.insert(entry.label.as_str()) {
            return Err(RankingParseError::DuplicateLabel(entry.label.clone()));
        }
        if entry.rank == 0 || entry.rank > max {
            return Err(RankingParseError::RankOutOfRange {
                label: entry.label.clone(),
                rank: entry.rank,
                max,
            });
        }
    }

    if entries.len() != labels.len() {
        return Err(RankingParseError::Incomplete {
            got: entries.len(),
            expected: labels.len(),
        });
    }

    Ok(entries)
}

/// The balanced object opening at the start of `remainder`.
fn balanced_object(remainder: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Combine parsed rankings into one order over every label.
///
/// Mean rank ascending; equal means keep stage 1 order; labels nobody ranked
/// go last. Independent of the order of `rankings`.
pub fn aggregate(labels: &LabelMap, rankings: &[RankingResponse]) -> AggregateRanking {
    let mut scored: Vec<(usize, AggregateEntry)> = labels
        .entries()
        .iter()
        .map(|label| {
            let ranks: Vec<u32> = rankings
                .iter()
                .filter_map(|r| r.rank_of(&label.label))
                .collect();
            let mean_rank = if ranks.is_empty() {
                None
            } else {
                let sum: u64 = ranks.iter().map(|&r| u64::from(r)).sum();
                Some(sum as f64 / ranks.len() as f64)
            };
            (
                label.stage1_index,
                AggregateEntry {
                    label: label.label.clone(),
                    model: label.model.clone(),
                    ranks,
                    mean_rank,
                },
            )
        })
        .collect();

    scored.sort_by(|(ia, a), (ib, b)| {
        let by_mean = match (a.mean_rank, b.mean_rank) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        by_mean.then(ia.cmp(ib))
    });

    AggregateRanking {
        entries: scored.into_iter().map(|(_, entry)| entry).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CostStatus, ModelCallResult, TokenUsage};

    fn labels(n: usize) -> LabelMap {
        let models: Vec<String> = (0..n).map(|i| format!("m/{i}")).collect();
        LabelMap::in_order(&models)
    }

    fn response(ranker: &str, order: &[(&str, u32)]) -> RankingResponse {
        RankingResponse {
            call: ModelCallResult {
                model: ranker.to_string(),
                content: String::new(),
                usage: TokenUsage::default(),
                cost_nanodollars: 0,
                cost_status: CostStatus::Estimated,
                generation_id: None,
                latency_ms: 0,
            },
            ranking: order
                .iter()
                .map(|(label, rank)| RankingEntry {
                    label: label.to_string(),
                    rank: *rank,
                    justification: None,
                })
                .collect(),
        }
    }

    #[test]
    fn parses_json_inside_prose() {
        let raw = r#"Sure. {"ranking":[{"label":"Response B","rank":1,"justification":"clear {sic}"},{"label":"a","rank":2}]} done"#;
        let parsed = parse_ranking(raw, &labels(2)).unwrap();
        assert_eq!(parsed[0].label, "B");
        assert_eq!(parsed[0].justification.as_deref(), Some("clear {sic}"));
        assert_eq!(parsed[1].label, "A");
        assert_eq!(parsed[1].rank, 2);
    }

    #[test]
    fn skips_stray_braces_before_the_ranking() {
        let raw = concat!(
            "Response A uses a set {1, 2} and Response B a map {\"k\": 1}.\n",
            r#"{"ranking":[{"label":"B","rank":1},{"label":"A","rank":2}]}"#
        );
        let parsed = parse_ranking(raw, &labels(2)).unwrap();
        let order: Vec<(&str, u32)> = parsed.iter().map(|e| (e.label.as_str(), e.rank)).collect();
        assert_eq!(order, vec![("B", 1), ("A", 2)]);
    }

    #[test]
    fn parses_final_ranking_list() {
        let raw =
            "Response A is weaker.\n\nFINAL RANKING:\n1. Response C\n2. Response A\n3. Response B\n";
        let parsed = parse_ranking(raw, &labels(3)).unwrap();
        let order: Vec<(&str, u32)> = parsed.iter().map(|e| (e.label.as_str(), e.rank)).collect();
        assert_eq!(order, vec![("C", 1), ("A", 2), ("B", 3)]);
    }

    #[test]
    fn rejects_partial_and_invalid_orders() {
        let l = labels(3);
        assert_eq!(
            parse_ranking(r#"{"ranking":[{"label":"A","rank":1}]}"#, &l),
            Err(RankingParseError::Incomplete { got: 1, expected: 3 })
        );
        assert_eq!(
            parse_ranking(
                r#"{"ranking":[{"label":"A","rank":1},{"label":"A","rank":2},{"label":"B","rank":3}]}"#,
                &l
            ),
            Err(RankingParseError::DuplicateLabel("A".into()))
        );
        assert!(matches!(
            parse_ranking(r#"{"ranking":[{"label":"Q","rank":1}]}"#, &l),
            Err(RankingParseError::UnknownLabel(_))
        ));
        assert!(matches!(
            parse_ranking(
                r#"{"ranking":[{"label":"A","rank":4},{"label":"B","rank":1},{"label":"C","rank":2}]}"#,
                &l
            ),
            Err(RankingParseError::RankOutOfRange { rank: 4, .. })
        ));
        assert_eq!(
            parse_ranking("I like them all.", &l),
            Err(RankingParseError::Unparseable)
        );
    }

    #[test]
    fn ties_are_accepted() {
        let raw = r#"{"ranking":[{"label":"A","rank":1},{"label":"B","rank":1}]}"#;
        assert!(parse_ranking(raw, &labels(2)).is_ok());
    }

    #[test]
    fn equal_means_keep_stage1_order() {
        // Means: A = 2.0, B = 2.0, C = 1.0.
        let rankings = vec![
            response("r/1", &[("A", 2), ("B", 3), ("C", 1)]),
            response("r/2", &[("A", 2), ("B", 1), ("C", 1)]),
        ];
        let agg = aggregate(&labels(3), &rankings);
        assert_eq!(agg.labels(), vec!["C", "A", "B"]);
        assert_eq!(agg.entries[1].mean_rank, Some(2.0));
        assert_eq!(agg.entries[2].ranks, vec![3, 1]);
    }

    #[test]
    fn aggregation_ignores_ranker_order() {
        let a = response("r/1", &[("A", 1), ("B", 2), ("C", 3)]);
        let b = response("r/2", &[("A", 3), ("B", 1), ("C", 2)]);
        let forward = aggregate(&labels(3), &[a.clone(), b.clone()]);
        let reverse = aggregate(&labels(3), &[b, a]);
        assert_eq!(forward.labels(), reverse.labels());
        assert_eq!(forward.labels(), vec!["B", "A", "C"]);
    }

    #[test]
    fn tie_break_uses_stage1_index_not_label() {
        // Label A points at the second stage 1 answer.
        let models = vec!["m/0".to_string(), "m/1".to_string()];
        let map = LabelMap::assign(&models, &mut ReversedRng);
        let agg = aggregate(&map, &[response("r", &[("A", 1), ("B", 1)])]);
        let first = map.get(agg.labels()[0]).unwrap();
        assert_eq!(first.stage1_index, 0);
    }

    #[test]
    fn unranked_labels_go_last() {
        let agg = aggregate(&labels(2), &[]);
        assert_eq!(agg.labels(), vec!["A", "B"]);
        assert!(agg.entries.iter().all(|e| e.mean_rank.is_none()));
    }

    /// Deterministic RNG whose shuffle of two elements swaps them.
    struct ReversedRng;

    impl rand::RngCore for ReversedRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            dest.fill(0);
            Ok(())
        }
    }
}
