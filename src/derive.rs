//! Derived views over already-synced collections.
//!
//! Everything here is a pure function of its inputs. Collections that are
//! still loading or not bound are passed as `None` and treated as empty.

use crate::types::Document;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// One collection to search and the fields to look at.
#[derive(Clone, Copy, Debug)]
pub struct SearchSource<'a> {
    pub collection: &'a str,
    pub documents: Option<&'a [Document]>,
    pub fields: &'a [&'a str],
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub collection: String,
    pub document: Document,
    /// First configured field that matched.
    pub matched_field: String,
}

/// Case-insensitive substring search across several collections.
///
/// String fields match on substring; array fields match if any string
/// element does. Hits are ordered by collection then document id and
/// duplicates collapse, so the result does not depend on input order.
pub fn search(sources: &[SearchSource<'_>], needle: &str) -> Vec<SearchHit> {
    let needle = needle.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let mut hits: BTreeMap<(String, String), SearchHit> = BTreeMap::new();

    for source in sources {
        for doc in source.documents.unwrap_or_default() {
            let matched = source
                .fields
                .iter()
                .find(|field| doc.get(field).is_some_and(|v| value_contains(v, &needle)));
            if let Some(field) = matched {
                hits.entry((source.collection.to_string(), doc.path.to_string()))
                    .or_insert_with(|| SearchHit {
                        collection: source.collection.to_string(),
                        document: doc.clone(),
                        matched_field: field.to_string(),
                    });
            }
        }
    }

    hits.into_values().collect()
}

fn value_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(items) => items.iter().any(|item| match item {
            Value::String(s) => s.to_lowercase().contains(needle),
            _ => false,
        }),
        _ => false,
    }
}

/// Documents whose array `field` contains `tag`; `None` keeps everything.
pub fn filter_by_tag(documents: Option<&[Document]>, field: &str, tag: Option<&str>) -> Vec<Document> {
    let documents = documents.unwrap_or_default();
    let Some(tag) = tag else {
        return documents.to_vec();
    };

    documents
        .iter()
        .filter(|doc| {
            doc.get(field)
                .and_then(Value::as_array)
                .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(tag)))
        })
        .cloned()
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatingSummary {
    pub count: usize,
    pub average: f64,
}

/// Average of `rating_field` grouped by `entity_field` (e.g. reviews by
/// event id). Documents missing either field are skipped.
pub fn average_ratings(
    documents: Option<&[Document]>,
    entity_field: &str,
    rating_field: &str,
) -> BTreeMap<String, RatingSummary> {
    let mut totals: BTreeMap<String, (usize, f64)> = BTreeMap::new();

    for doc in documents.unwrap_or_default() {
        let (Some(entity), Some(rating)) = (doc.get_str(entity_field), doc.get_f64(rating_field))
        else {
            continue;
        };
        let entry = totals.entry(entity.to_string()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += rating;
    }

    totals
        .into_iter()
        .map(|(entity, (count, sum))| {
            (
                entity,
                RatingSummary {
                    count,
                    average: sum / count as f64,
                },
            )
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeaderboardEntry {
    /// 1-based; equal scores share a rank.
    pub rank: usize,
    pub id: String,
    pub score: f64,
}

/// Rank documents by the sum of `stat_fields`.
///
/// Numeric fields add their value, array fields add their length (e.g.
/// completed projects). Ties are broken by id.
pub fn leaderboard(
    documents: Option<&[Document]>,
    stat_fields: &[&str],
    limit: usize,
) -> Vec<LeaderboardEntry> {
    let mut seen = BTreeSet::new();
    let mut scored: Vec<(String, f64)> = documents
        .unwrap_or_default()
        .iter()
        .filter(|doc| seen.insert(doc.path.clone()))
        .map(|doc| {
            let score = stat_fields.iter().map(|f| stat_value(doc, f)).sum();
            (doc.id().to_string(), score)
        })
        .collect();

    scored.sort_by(|(a_id, a), (b_id, b)| {
        b.partial_cmp(a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a_id.cmp(b_id))
    });

    let mut entries: Vec<LeaderboardEntry> = Vec::with_capacity(scored.len().min(limit));
    for (position, (id, score)) in scored.into_iter().take(limit).enumerate() {
        let rank = match entries.last() {
            Some(prev) if prev.score == score => prev.rank,
            _ => position + 1,
        };
        entries.push(LeaderboardEntry { rank, id, score });
    }
    entries
}

fn stat_value(doc: &Document, field: &str) -> f64 {
    match doc.get(field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Value::Array(items)) => items.len() as f64,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentPath;
    use serde_json::json;

    fn doc(path: &str, value: Value) -> Document {
        Document::from_json(DocumentPath::parse(path).unwrap(), value)
    }

    #[test]
    fn test_search_across_collections() {
        let projects = vec![
            doc("projects/p1", json!({"title": "Campus Robotics", "tags": ["AI/ML"]})),
            doc("projects/p2", json!({"title": "Poster design", "tags": ["Design"]})),
        ];
        let events = vec![doc("events/e1", json!({"title": "ML reading group"}))];

        let hits = search(
            &[
                SearchSource {
                    collection: "projects",
                    documents: Some(&projects),
                    fields: &["title", "tags"],
                },
                SearchSource {
                    collection: "events",
                    documents: Some(&events),
                    fields: &["title"],
                },
                SearchSource {
                    collection: "users",
                    documents: None,
                    fields: &["name"],
                },
            ],
            "  ml ",
        );

        let ids: Vec<(&str, &str)> = hits
            .iter()
            .map(|h| (h.collection.as_str(), h.document.id()))
            .collect();
        assert_eq!(ids, vec![("events", "e1"), ("projects", "p1")]);
        assert_eq!(hits[1].matched_field, "tags");
    }

    #[test]
    fn test_empty_needle_matches_nothing() {
        let projects = vec![doc("projects/p1", json!({"title": "x"}))];
        let source = SearchSource {
            collection: "projects",
            documents: Some(&projects),
            fields: &["title"],
        };
        assert!(search(&[source], "   ").is_empty());
    }

    #[test]
    fn test_filter_by_tag() {
        let projects = vec![
            doc("projects/p1", json!({"tags": ["AI/ML"]})),
            doc("projects/p2", json!({"tags": ["Design"]})),
            doc("projects/p3", json!({})),
        ];
        let filtered = filter_by_tag(Some(&projects), "tags", Some("AI/ML"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id(), "p1");

        assert_eq!(filter_by_tag(Some(&projects), "tags", None).len(), 3);
        assert!(filter_by_tag(None, "tags", Some("AI/ML")).is_empty());
    }

    #[test]
    fn test_average_ratings() {
        let reviews = vec![
            doc("reviews/r1", json!({"eventId": "e1", "rating": 4})),
            doc("reviews/r2", json!({"eventId": "e1", "rating": 5})),
            doc("reviews/r3", json!({"eventId": "e2", "rating": 3})),
            doc("reviews/r4", json!({"eventId": "e2"})),
        ];
        let ratings = average_ratings(Some(&reviews), "eventId", "rating");

        assert_eq!(ratings["e1"], RatingSummary { count: 2, average: 4.5 });
        assert_eq!(ratings["e2"], RatingSummary { count: 1, average: 3.0 });
        assert!(average_ratings(None, "eventId", "rating").is_empty());
    }

    #[test]
    fn test_leaderboard_ranks_and_ties() {
        let users = vec![
            doc("users/a", json!({"points": 10, "projects": ["p1"]})),
            doc("users/b", json!({"points": 20})),
            doc("users/c", json!({"points": 5, "projects": ["p1", "p2", "p3", "p4", "p5", "p6"]})),
            doc("users/d", json!({"points": "n/a"})),
        ];

        let board = leaderboard(Some(&users), &["points", "projects"], 3);
        let summary: Vec<(usize, &str, f64)> = board
            .iter()
            .map(|e| (e.rank, e.id.as_str(), e.score))
            .collect();
        assert_eq!(summary, vec![(1, "b", 20.0), (2, "a", 11.0), (2, "c", 11.0)]);

        assert!(leaderboard(None, &["points"], 10).is_empty());
    }
}
