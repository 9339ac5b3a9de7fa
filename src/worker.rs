use std::sync::Arc;
use std::time::Duration;

use crate::event::{Event, SigVerifier};
use crate::kv::{keys, KvOp, KvStore};
use crate::proto::{
    parse_frame, ClientMessage, RelayMessage, WorkItem, DEFAULT_QUERY_LIMIT, MAX_FILTER_LIMIT,
    MAX_SUBS_PER_CONN,
};
use crate::pubsub::{conn_key, SubscriptionRouter};
use crate::storage::EventStore;
use crate::subscription::Subscription;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum frames taken from the work list per cycle.
    pub batch: usize,
    /// Blocking-pop timeout; also bounds how quickly shutdown is noticed.
    pub pop_timeout: Duration,
    /// TTL applied to response lists on every write.
    pub response_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> WorkerConfig {
        WorkerConfig {
            batch: 1000,
            pop_timeout: Duration::from_secs(1),
            response_ttl: Duration::from_secs(5),
        }
    }
}

/// One relay worker. Operators run N identical copies of this; they
/// coordinate only through the shared work list and response lists.
pub struct RelayWorker {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn EventStore>,
    verifier: Arc<dyn SigVerifier>,
    router: SubscriptionRouter,
    config: WorkerConfig,
    log: slog::Logger,
}

impl RelayWorker {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn EventStore>,
        verifier: Arc<dyn SigVerifier>,
        router: SubscriptionRouter,
        config: WorkerConfig,
        log: slog::Logger,
    ) -> RelayWorker {
        RelayWorker {
            kv,
            store,
            verifier,
            router,
            config,
            log,
        }
    }

    /// Endless consume loop. Per-frame failures are reported to the
    /// originating client and never abort the loop; store outages back
    /// off briefly and continue.
    pub async fn run(&self) {
        slog::info!(self.log, "relay worker consuming"; "list" => keys::WORK_LIST);
        loop {
            match self.next_batch().await {
                Ok(batch) => {
                    for raw in batch {
                        self.handle_raw(&raw).await;
                    }
                }
                Err(e) => {
                    slog::warn!(self.log, "work list pop failed"; "error" => e.to_string());
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// One blocking pop for the head of the batch, then a non-blocking
    /// drain up to the batch size.
    async fn next_batch(&self) -> Result<Vec<String>, crate::kv::KvError> {
        let first = match self.kv.blpop(keys::WORK_LIST, self.config.pop_timeout).await? {
            Some(item) => item,
            None => return Ok(Vec::new()),
        };
        let mut batch = vec![first];
        if self.config.batch > 1 {
            let rest = self
                .kv
                .lpop_count(keys::WORK_LIST, self.config.batch - 1)
                .await?;
            batch.extend(rest);
        }
        Ok(batch)
    }

    async fn handle_raw(&self, raw: &str) {
        let item = match WorkItem::decode(raw) {
            Ok(item) => item,
            Err(e) => {
                slog::warn!(self.log, "discarding unreadable work item"; "error" => e.to_string());
                return;
            }
        };
        self.handle_frame(&item).await;
    }

    pub(crate) async fn handle_frame(&self, item: &WorkItem) {
        match parse_frame(item.frame.as_bytes()) {
            Ok(ClientMessage::Event(event)) => self.handle_event(&item.conn_id, *event).await,
            Ok(ClientMessage::Req(sub)) => self.handle_req(&item.conn_id, sub).await,
            Ok(ClientMessage::Close(sub_id)) => self.handle_close(&item.conn_id, &sub_id).await,
            Ok(ClientMessage::Auth(_)) => {
                self.respond(&item.conn_id, RelayMessage::notice("unsupported: AUTH"))
                    .await;
            }
            Ok(ClientMessage::Unknown(verb)) => {
                self.respond(
                    &item.conn_id,
                    RelayMessage::notice(&format!("unsupported: {}", verb)),
                )
                .await;
            }
            Err(e) => {
                self.respond(
                    &item.conn_id,
                    RelayMessage::notice(&format!("could not process message: {}", e)),
                )
                .await;
            }
        }
    }

    async fn handle_event(&self, conn_id: &str, event: Event) {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = event.validate_structure(now) {
            self.respond(conn_id, RelayMessage::ok(&event.id, false, &e.to_string()))
                .await;
            return;
        }
        if let Err(e) = event.validate_id() {
            self.respond(conn_id, RelayMessage::ok(&event.id, false, &e.to_string()))
                .await;
            return;
        }
        if !self.verifier.verify(&event) {
            self.respond(
                conn_id,
                RelayMessage::ok(&event.id, false, "invalid: signature verification failed"),
            )
            .await;
            return;
        }

        if let Err(e) = self.store.store(&event).await {
            slog::warn!(self.log, "event not persisted"; "id" => &event.id, "error" => e.to_string());
            self.respond(
                conn_id,
                RelayMessage::notice("error: storage unavailable, event not persisted"),
            )
            .await;
            return;
        }
        self.respond(conn_id, RelayMessage::ok(&event.id, true, ""))
            .await;

        // Real-time fan-out to every live matching subscription.
        match self.router.find_matching(&event).await {
            Ok(matches) => {
                slog::debug!(
                    self.log,
                    "broadcasting event";
                    "id" => &event.id,
                    "matches" => matches.len(),
                );
                for matched in matches {
                    self.respond(
                        &matched.conn_id,
                        RelayMessage::event(&matched.sub_id, &event),
                    )
                    .await;
                }
            }
            Err(e) => {
                slog::warn!(
                    self.log,
                    "subscription match failed, event stored but not broadcast";
                    "id" => &event.id,
                    "error" => e.to_string(),
                );
            }
        }
    }

    async fn handle_req(&self, conn_id: &str, sub: Subscription) {
        let existing = match self.kv.smembers(&conn_key(conn_id)).await {
            Ok(members) => members,
            Err(e) => {
                slog::warn!(self.log, "subscription lookup failed"; "error" => e.to_string());
                self.respond(
                    conn_id,
                    RelayMessage::closed(&sub.id, "error: subscription store unavailable"),
                )
                .await;
                return;
            }
        };
        if existing.len() as u64 >= MAX_SUBS_PER_CONN && !existing.contains(&sub.id) {
            self.respond(
                conn_id,
                RelayMessage::closed(&sub.id, "error: too many subscriptions"),
            )
            .await;
            return;
        }

        if let Err(e) = self.router.subscribe(conn_id, &sub.id, &sub.filters).await {
            slog::warn!(self.log, "subscribe failed"; "sub" => &sub.id, "error" => e.to_string());
            self.respond(
                conn_id,
                RelayMessage::closed(&sub.id, "error: could not register subscription"),
            )
            .await;
            return;
        }

        // Historical phase, then EOSE to hand over to real-time flow.
        let limit = sub.query_limit(DEFAULT_QUERY_LIMIT, MAX_FILTER_LIMIT);
        match self.store.query(&sub.filters, limit).await {
            Ok(events) => {
                for event in &events {
                    self.respond(conn_id, RelayMessage::event(&sub.id, event))
                        .await;
                }
            }
            Err(e) => {
                slog::warn!(self.log, "historical query failed"; "sub" => &sub.id, "error" => e.to_string());
                self.respond(conn_id, RelayMessage::notice("error: historical query failed"))
                    .await;
                return;
            }
        }
        self.respond(conn_id, RelayMessage::eose(&sub.id)).await;
    }

    async fn handle_close(&self, conn_id: &str, sub_id: &str) {
        match self.router.unsubscribe(conn_id, sub_id).await {
            Ok(true) => {
                self.respond(conn_id, RelayMessage::closed(sub_id, "")).await;
            }
            Ok(false) => {}
            Err(e) => {
                slog::warn!(self.log, "unsubscribe failed"; "sub" => sub_id, "error" => e.to_string());
            }
        }
    }

    /// Queue a frame for the frontend to deliver. The TTL rides along so
    /// lists for vanished connections age out on their own.
    async fn respond(&self, conn_id: &str, message: RelayMessage) {
        let key = keys::response(conn_id);
        let ops = vec![
            KvOp::RPush {
                key: key.clone(),
                value: message.to_frame(),
            },
            KvOp::Expire {
                key,
                ttl: self.config.response_ttl,
            },
        ];
        if let Err(e) = self.kv.exec_atomic(ops).await {
            slog::warn!(
                self.log,
                "failed to queue response";
                "conn" => conn_id,
                "error" => e.to_string(),
            );
        }
    }
}
