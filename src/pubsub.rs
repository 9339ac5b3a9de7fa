use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::event::Event;
use crate::kv::{KvError, KvOp, KvStore};
use crate::subscription::Filter;

/// Tag names maintained in the inverted index. Constraints on any other
/// tag letter are still honored, but only by the re-evaluation pass.
pub const INDEXED_TAGS: [&str; 7] = ["e", "p", "a", "t", "d", "r", "g"];

/// Subscriptions with no kind/author/tag constraint land here and are
/// considered for every event.
pub const ALL_INDEX_KEY: &str = "sub:index:all";

const INDEX_PATTERN: &str = "sub:index:*";

fn kind_key(kind: u64) -> String {
    format!("sub:index:kind:{}", kind)
}

fn author_key(pubkey: &str) -> String {
    format!("sub:index:author:{}", pubkey)
}

fn tag_key(name: &str, value: &str) -> String {
    format!("sub:index:tag:{}:{}", name, value)
}

fn meta_key(conn_id: &str, sub_id: &str) -> String {
    format!("sub:{}:{}", conn_id, sub_id)
}

pub fn conn_key(conn_id: &str) -> String {
    format!("sub:conn:{}", conn_id)
}

/// Index keys a filter must be registered under so that every event it
/// matches can reach it. Only tag names in `INDEXED_TAGS` may project to
/// tag keys; the event-side projection never emits keys for other names,
/// so a filter constrained only by such tags must stay reachable through
/// the catch-all set and be narrowed by re-evaluation.
pub fn filter_index_keys(filter: &Filter) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(kinds) = &filter.kinds {
        keys.extend(kinds.iter().map(|k| kind_key(*k)));
    }
    if let Some(authors) = &filter.authors {
        keys.extend(authors.iter().map(|a| author_key(a)));
    }
    for (name, values) in filter.tag_constraints() {
        if INDEXED_TAGS.contains(&name) {
            keys.extend(values.iter().map(|v| tag_key(name, v)));
        }
    }
    if keys.is_empty() {
        // Pure time-range, ids-only, empty, and non-indexed-tag-only
        // filters are all reachable only through the catch-all set.
        keys.push(ALL_INDEX_KEY.to_owned());
    }
    keys
}

/// Index keys that could hold a subscription interested in this event.
pub fn event_index_keys(event: &Event) -> Vec<String> {
    let mut keys = vec![
        ALL_INDEX_KEY.to_owned(),
        kind_key(event.kind),
        author_key(&event.pubkey),
    ];
    for tag in &event.tags {
        if let (Some(name), Some(value)) = (tag.first(), tag.get(1)) {
            if INDEXED_TAGS.contains(&name.as_str()) {
                keys.push(tag_key(name, value));
            }
        }
    }
    keys
}

#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("subscription store operation failed: {0}")]
    Kv(#[from] KvError),
    #[error("subscription metadata could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A live subscription that matched an event.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMatch {
    pub conn_id: String,
    pub sub_id: String,
    pub filters: Vec<Filter>,
}

/// The subscription router. All state lives in the shared store so every
/// process sees the same index; false positives in the index are expected
/// and filtered by full re-evaluation.
#[derive(Clone)]
pub struct SubscriptionRouter {
    kv: Arc<dyn KvStore>,
    meta_ttl: Duration,
    index_ttl: Duration,
    log: slog::Logger,
}

impl SubscriptionRouter {
    pub fn new(
        kv: Arc<dyn KvStore>,
        meta_ttl: Duration,
        index_ttl: Duration,
        log: slog::Logger,
    ) -> SubscriptionRouter {
        // Index entries must outlive metadata so a stale index member is
        // observable as metadata-absence instead of dangling.
        let index_ttl = if index_ttl <= meta_ttl {
            let clamped = meta_ttl + Duration::from_secs(60);
            slog::warn!(
                log,
                "index TTL not above metadata TTL, clamping";
                "configured" => format!("{:?}", index_ttl),
                "clamped" => format!("{:?}", clamped),
            );
            clamped
        } else {
            index_ttl
        };
        SubscriptionRouter {
            kv,
            meta_ttl,
            index_ttl,
            log,
        }
    }

    fn member(conn_id: &str, sub_id: &str) -> String {
        format!("{}:{}", conn_id, sub_id)
    }

    async fn stored_index_keys(
        &self,
        conn_id: &str,
        sub_id: &str,
    ) -> Result<Option<HashSet<String>>, PubSubError> {
        let raw = self.kv.get(&meta_key(conn_id, sub_id)).await?;
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str::<Vec<Filter>>(&raw) {
            Ok(filters) => Ok(Some(
                filters.iter().flat_map(filter_index_keys).collect(),
            )),
            Err(e) => {
                slog::warn!(
                    self.log,
                    "discarding unreadable subscription metadata";
                    "conn" => conn_id,
                    "sub" => sub_id,
                    "error" => e.to_string(),
                );
                Ok(Some(HashSet::new()))
            }
        }
    }

    /// Register or atomically replace a subscription. On return the
    /// metadata is durably set, every relevant index set contains the
    /// member, and index keys the old filter set used but the new one
    /// does not have been vacated.
    pub async fn subscribe(
        &self,
        conn_id: &str,
        sub_id: &str,
        filters: &[Filter],
    ) -> Result<(), PubSubError> {
        let member = Self::member(conn_id, sub_id);
        let old_keys = self
            .stored_index_keys(conn_id, sub_id)
            .await?
            .unwrap_or_default();
        let new_keys: HashSet<String> = filters.iter().flat_map(filter_index_keys).collect();

        let mut ops = vec![
            KvOp::SetEx {
                key: meta_key(conn_id, sub_id),
                value: serde_json::to_string(filters)?,
                ttl: self.meta_ttl,
            },
            KvOp::SAdd {
                key: conn_key(conn_id),
                member: sub_id.to_owned(),
            },
            KvOp::Expire {
                key: conn_key(conn_id),
                ttl: self.meta_ttl,
            },
        ];
        for key in &new_keys {
            ops.push(KvOp::SAdd {
                key: key.clone(),
                member: member.clone(),
            });
            ops.push(KvOp::Expire {
                key: key.clone(),
                ttl: self.index_ttl,
            });
        }
        for key in old_keys.difference(&new_keys) {
            ops.push(KvOp::SRem {
                key: key.clone(),
                member: member.clone(),
            });
        }
        self.kv.exec_atomic(ops).await?;
        slog::debug!(
            self.log,
            "subscription registered";
            "conn" => conn_id,
            "sub" => sub_id,
            "filters" => filters.len(),
            "index_keys" => new_keys.len(),
        );
        Ok(())
    }

    /// Tear down one subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, conn_id: &str, sub_id: &str) -> Result<bool, PubSubError> {
        let keys = match self.stored_index_keys(conn_id, sub_id).await? {
            Some(keys) => keys,
            None => return Ok(false),
        };
        let member = Self::member(conn_id, sub_id);
        let mut ops = vec![
            KvOp::Del {
                key: meta_key(conn_id, sub_id),
            },
            KvOp::SRem {
                key: conn_key(conn_id),
                member: sub_id.to_owned(),
            },
        ];
        for key in &keys {
            ops.push(KvOp::SRem {
                key: key.clone(),
                member: member.clone(),
            });
        }
        self.kv.exec_atomic(ops).await?;
        Ok(true)
    }

    /// Tear down everything the connection owns. Returns the number of
    /// subscriptions removed.
    pub async fn unsubscribe_all(&self, conn_id: &str) -> Result<usize, PubSubError> {
        let sub_ids = self.kv.smembers(&conn_key(conn_id)).await?;
        let mut removed = 0;
        for sub_id in &sub_ids {
            if self.unsubscribe(conn_id, sub_id).await? {
                removed += 1;
            }
        }
        self.kv.del(&conn_key(conn_id)).await?;
        Ok(removed)
    }

    /// Re-arm the TTLs for every subscription the connection owns.
    /// Idempotent; the frontend calls this periodically for live sockets.
    pub async fn refresh_connection(&self, conn_id: &str) -> Result<(), PubSubError> {
        let sub_ids = self.kv.smembers(&conn_key(conn_id)).await?;
        if sub_ids.is_empty() {
            return Ok(());
        }
        let mut ops = vec![KvOp::Expire {
            key: conn_key(conn_id),
            ttl: self.meta_ttl,
        }];
        let mut index_keys = HashSet::new();
        for sub_id in &sub_ids {
            match self.stored_index_keys(conn_id, sub_id).await? {
                Some(keys) => {
                    ops.push(KvOp::Expire {
                        key: meta_key(conn_id, sub_id),
                        ttl: self.meta_ttl,
                    });
                    index_keys.extend(keys);
                }
                None => continue,
            }
        }
        for key in index_keys {
            ops.push(KvOp::Expire {
                key,
                ttl: self.index_ttl,
            });
        }
        self.kv.exec_atomic(ops).await?;
        Ok(())
    }

    /// Find the live subscriptions whose filters the event satisfies.
    /// Index candidates with missing metadata are stale and skipped.
    pub async fn find_matching(&self, event: &Event) -> Result<Vec<SubscriptionMatch>, PubSubError> {
        let keys = event_index_keys(event);
        let candidates = self.kv.sunion(&keys).await?;
        let mut matches = Vec::new();
        for candidate in candidates {
            let (conn_id, sub_id) = match candidate.split_once(':') {
                Some(parts) => parts,
                None => {
                    slog::warn!(self.log, "malformed index member"; "member" => &candidate);
                    continue;
                }
            };
            let raw = match self.kv.get(&meta_key(conn_id, sub_id)).await? {
                Some(raw) => raw,
                None => continue,
            };
            let filters: Vec<Filter> = match serde_json::from_str(&raw) {
                Ok(filters) => filters,
                Err(e) => {
                    slog::warn!(
                        self.log,
                        "skipping unreadable subscription metadata";
                        "member" => &candidate,
                        "error" => e.to_string(),
                    );
                    continue;
                }
            };
            if filters.iter().any(|f| f.interested_in_event(event)) {
                matches.push(SubscriptionMatch {
                    conn_id: conn_id.to_owned(),
                    sub_id: sub_id.to_owned(),
                    filters,
                });
            }
        }
        Ok(matches)
    }

    /// Maintenance sweep deleting index sets with no members left.
    pub async fn cleanup_empty_indexes(&self) -> Result<usize, PubSubError> {
        let keys = self.kv.scan(INDEX_PATTERN).await?;
        let mut reclaimed = 0;
        for key in keys {
            if self.kv.scard(&key).await? == 0 {
                self.kv.del(&key).await?;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            slog::debug!(self.log, "reclaimed empty index sets"; "count" => reclaimed);
        }
        Ok(reclaimed)
    }
}
