use std::sync::Arc;
use std::time::Duration;

use crate::kv::{keys, KvError, KvStore};
use crate::proto::WorkItem;
use crate::queue::ImmortalQueue;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Messages republished per drain cycle.
    pub batch: usize,
    /// Sleep when the queue is empty.
    pub idle_wait: Duration,
    /// Backoff after a store failure.
    pub error_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> BridgeConfig {
        BridgeConfig {
            batch: 1000,
            idle_wait: Duration::from_millis(10),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Drain the ingress queue onto the shared work list, forever. The
/// bridge shares the queue with the acceptor by reference, so it runs as
/// a task inside the frontend process.
pub async fn drain_loop(
    queue: Arc<ImmortalQueue>,
    kv: Arc<dyn KvStore>,
    config: BridgeConfig,
    log: slog::Logger,
) {
    slog::info!(log, "bridge draining"; "list" => keys::WORK_LIST, "batch" => config.batch);
    loop {
        match drain_once(&queue, kv.as_ref(), config.batch).await {
            Ok(0) => {
                tokio::time::sleep(config.idle_wait).await;
            }
            Ok(count) => {
                slog::debug!(log, "republished batch"; "count" => count);
            }
            Err(e) => {
                slog::warn!(log, "failed to republish batch"; "error" => e.to_string());
                tokio::time::sleep(config.error_backoff).await;
            }
        }
    }
}

/// One pop-and-republish cycle. A single multi-value RPUSH keeps the
/// popped ordering intact on the work list.
pub(crate) async fn drain_once(
    queue: &ImmortalQueue,
    kv: &dyn KvStore,
    batch: usize,
) -> Result<usize, KvError> {
    let messages = queue.pop(batch);
    if messages.is_empty() {
        return Ok(0);
    }
    let items: Vec<String> = messages
        .iter()
        .map(|msg| {
            WorkItem {
                conn_id: msg.conn_id.clone(),
                frame: String::from_utf8_lossy(&msg.payload).into_owned(),
            }
            .encode()
        })
        .collect();
    kv.rpush(keys::WORK_LIST, &items).await?;
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::queue::{Priority, QueueConfig};

    #[tokio::test]
    async fn drained_batch_lands_in_priority_then_fifo_order() {
        let queue = ImmortalQueue::new(QueueConfig::default());
        let kv = MemoryKv::new();

        queue.push(bytes::Bytes::from_static(b"[\"EVENT\",{}]"), "c1", Priority::Normal);
        queue.push(bytes::Bytes::from_static(b"[\"REQ\",\"s1\",{}]"), "c1", Priority::High);
        queue.push(bytes::Bytes::from_static(b"[\"CLOSE\",\"s1\"]"), "c2", Priority::Critical);

        let count = drain_once(&queue, &kv, 100).await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(queue.len(), 0);

        let raw = kv.lpop_count(keys::WORK_LIST, 100).await.unwrap();
        let items: Vec<WorkItem> = raw.iter().map(|r| WorkItem::decode(r).unwrap()).collect();
        assert_eq!(items[0].frame, "[\"CLOSE\",\"s1\"]");
        assert_eq!(items[0].conn_id, "c2");
        assert_eq!(items[1].frame, "[\"REQ\",\"s1\",{}]");
        assert_eq!(items[2].frame, "[\"EVENT\",{}]");
    }

    #[tokio::test]
    async fn empty_queue_is_a_quiet_no_op() {
        let queue = ImmortalQueue::new(QueueConfig::default());
        let kv = MemoryKv::new();
        assert_eq!(drain_once(&queue, &kv, 100).await.unwrap(), 0);
        assert_eq!(kv.llen(keys::WORK_LIST).await.unwrap(), 0);
    }
}
