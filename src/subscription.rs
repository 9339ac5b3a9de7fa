use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Event;

#[derive(Error, Debug, PartialEq)]
pub enum FilterError {
    #[error("invalid filter: tag constraint key '{0}' is not a single-letter #tag")]
    BadTagKey(String),
}

/// A single query filter. All present fields must admit an event for the
/// filter to match; list fields are any-of within themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Tag-value constraints, keyed by the wire form `#<letter>`.
    #[serde(flatten)]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Reject constraint keys that are not of the `#<letter>` form. The
    /// named fields have already been peeled off by deserialization, so
    /// anything left in the map must be a tag constraint.
    pub fn validate(&self) -> Result<(), FilterError> {
        for key in self.tags.keys() {
            let mut chars = key.chars();
            let well_formed = chars.next() == Some('#')
                && matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
                && chars.next().is_none();
            if !well_formed {
                return Err(FilterError::BadTagKey(key.clone()));
            }
        }
        Ok(())
    }

    /// Tag constraints with the `#` prefix stripped.
    pub fn tag_constraints(&self) -> impl Iterator<Item = (&str, &Vec<String>)> {
        self.tags
            .iter()
            .filter_map(|(k, v)| k.strip_prefix('#').map(|name| (name, v)))
    }

    /// Full filter evaluation. This is the oracle; the inverted index is
    /// only a prefilter and every candidate must pass through here.
    pub fn interested_in_event(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, values) in self.tag_constraints() {
            let admitted = event.tags.iter().any(|tag| {
                tag.first().map(|n| n == name).unwrap_or(false)
                    && tag.get(1).map(|v| values.contains(v)).unwrap_or(false)
            });
            if !admitted {
                return false;
            }
        }
        true
    }
}

/// An active subscription: a client-chosen id plus OR-combined filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    /// Effective historical-query limit: the largest per-filter limit,
    /// defaulted and capped.
    pub fn query_limit(&self, default: u64, cap: u64) -> usize {
        self.filters
            .iter()
            .filter_map(|f| f.limit)
            .max()
            .unwrap_or(default)
            .min(cap) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::signed_event;

    fn filter_json(json: &str) -> Filter {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = filter_json("{}");
        let event = signed_event(7, vec![], "anything", 1_700_000_000);
        assert!(filter.interested_in_event(&event));
    }

    #[test]
    fn every_present_field_must_admit() {
        let event = signed_event(
            1,
            vec![vec!["e".to_owned(), "E1".to_owned()]],
            "x",
            1_700_000_000,
        );
        let author = event.pubkey.clone();

        assert!(filter_json(&format!(
            "{{\"kinds\":[1],\"authors\":[\"{}\"]}}",
            author
        ))
        .interested_in_event(&event));
        assert!(!filter_json("{\"kinds\":[2]}").interested_in_event(&event));
        assert!(!filter_json(&format!("{{\"authors\":[\"{}\"],\"kinds\":[3]}}", author))
            .interested_in_event(&event));
        assert!(filter_json(&format!("{{\"ids\":[\"{}\"]}}", event.id)).interested_in_event(&event));
        assert!(!filter_json("{\"ids\":[\"feed\"]}").interested_in_event(&event));
    }

    #[test]
    fn time_window_bounds_are_inclusive() {
        let event = signed_event(1, vec![], "x", 1_000);
        assert!(filter_json("{\"since\":1000}").interested_in_event(&event));
        assert!(filter_json("{\"until\":1000}").interested_in_event(&event));
        assert!(!filter_json("{\"since\":1001}").interested_in_event(&event));
        assert!(!filter_json("{\"until\":999}").interested_in_event(&event));
    }

    #[test]
    fn tag_constraints_match_name_and_value() {
        let event = signed_event(
            1,
            vec![
                vec!["e".to_owned(), "E1".to_owned()],
                vec!["p".to_owned(), "P1".to_owned()],
            ],
            "x",
            1_700_000_000,
        );
        assert!(filter_json("{\"#e\":[\"E1\",\"E2\"]}").interested_in_event(&event));
        assert!(!filter_json("{\"#e\":[\"E9\"]}").interested_in_event(&event));
        // Constraint on a tag the event does not carry at all.
        assert!(!filter_json("{\"#t\":[\"nostr\"]}").interested_in_event(&event));
        // Unindexed-letter tags still evaluate.
        assert!(!filter_json("{\"#x\":[\"y\"]}").interested_in_event(&event));
    }

    #[test]
    fn tag_key_validation() {
        assert!(filter_json("{\"#e\":[\"E1\"]}").validate().is_ok());
        let bad = filter_json("{\"#ee\":[\"E1\"]}");
        assert_eq!(
            bad.validate(),
            Err(FilterError::BadTagKey("#ee".to_owned()))
        );
    }

    #[test]
    fn filters_or_combine_across_a_subscription() {
        let event = signed_event(1, vec![], "x", 1_700_000_000);
        let filters = vec![filter_json("{\"kinds\":[9]}"), filter_json("{\"kinds\":[1]}")];
        assert!(filters.iter().any(|f| f.interested_in_event(&event)));

        let none = vec![filter_json("{\"kinds\":[9]}")];
        assert!(!none.iter().any(|f| f.interested_in_event(&event)));
    }

    #[test]
    fn query_limit_defaults_and_caps() {
        let sub = Subscription {
            id: "s".to_owned(),
            filters: vec![filter_json("{\"limit\":40}"), filter_json("{\"limit\":90}")],
        };
        assert_eq!(sub.query_limit(500, 5000), 90);

        let unlimited = Subscription {
            id: "s".to_owned(),
            filters: vec![filter_json("{}")],
        };
        assert_eq!(unlimited.query_limit(500, 5000), 500);

        let huge = Subscription {
            id: "s".to_owned(),
            filters: vec![filter_json("{\"limit\":999999}")],
        };
        assert_eq!(huge.query_limit(500, 5000), 5000);
    }

    #[test]
    fn filters_round_trip_through_json() {
        let filter = filter_json("{\"kinds\":[1,2],\"#e\":[\"E1\"],\"since\":5}");
        let encoded = serde_json::to_string(&filter).unwrap();
        let decoded: Filter = serde_json::from_str(&encoded).unwrap();
        assert_eq!(filter, decoded);
    }
}
