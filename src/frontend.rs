use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::kv::{keys, KvStore};
use crate::proto::{inspect, rejection_frame, RelayMessage, MAX_FRAME_BYTES};
use crate::pubsub::SubscriptionRouter;
use crate::queue::{ImmortalQueue, Priority, QueueState};

#[derive(Debug, Clone)]
pub struct FrontendConfig {
    pub listen: String,
    /// Cadence of the per-connection response poll.
    pub poll_interval: Duration,
    /// TTL re-armed on the response list each time it is consumed.
    pub response_ttl: Duration,
    /// Subscription TTLs are refreshed every this many poll ticks.
    pub refresh_every_ticks: u32,
    /// Grace before closing a socket on the breaker-open path, so the
    /// client reconnects after the cooldown rather than into it.
    pub breaker_close_delay: Duration,
}

impl Default for FrontendConfig {
    fn default() -> FrontendConfig {
        FrontendConfig {
            listen: "127.0.0.1:8080".to_owned(),
            poll_interval: Duration::from_millis(100),
            response_ttl: Duration::from_secs(5),
            refresh_every_ticks: 10,
            breaker_close_delay: Duration::from_secs(1),
        }
    }
}

/// Accept websocket clients until interrupted. Each connection gets its
/// own task; a misbehaving socket can only take down itself.
pub async fn run(
    config: FrontendConfig,
    queue: Arc<ImmortalQueue>,
    kv: Arc<dyn KvStore>,
    router: SubscriptionRouter,
    log: slog::Logger,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    slog::info!(log, "accepting websocket clients"; "listen" => &config.listen);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                slog::info!(log, "interrupt received, closing listener");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let conn_log = log.new(slog::o!("peer" => peer.to_string()));
                        tokio::task::spawn(handle_connection(
                            stream,
                            config.clone(),
                            queue.clone(),
                            kv.clone(),
                            router.clone(),
                            conn_log,
                        ));
                    }
                    Err(e) => {
                        slog::warn!(log, "accept failed"; "error" => e.to_string());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    config: FrontendConfig,
    queue: Arc<ImmortalQueue>,
    kv: Arc<dyn KvStore>,
    router: SubscriptionRouter,
    log: slog::Logger,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            slog::debug!(log, "websocket handshake failed"; "error" => e.to_string());
            return;
        }
    };

    let conn_id = uuid::Uuid::new_v4().to_string();
    let log = log.new(slog::o!("conn" => conn_id.clone()));
    slog::info!(log, "client connected");

    let (mut sink, mut inbound) = ws.split();

    // Single writer task; the poller and the rejection path both feed it
    // so outbound frames never interleave mid-write.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::task::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let poller = tokio::task::spawn(poll_responses(
        conn_id.clone(),
        kv.clone(),
        router.clone(),
        config.clone(),
        out_tx.clone(),
        log.new(slog::o!("task" => "poller")),
    ));

    let mut last_warned: Option<QueueState> = None;
    while let Some(frame) = inbound.next().await {
        let data = match frame {
            Ok(Message::Text(text)) => bytes::Bytes::from(text),
            Ok(Message::Binary(bin)) => bytes::Bytes::from(bin),
            Ok(Message::Close(_)) => break,
            // Ping/pong are answered by the protocol layer.
            Ok(_) => continue,
            Err(e) => {
                slog::debug!(log, "socket read failed"; "error" => e.to_string());
                break;
            }
        };
        let keep_open =
            handle_inbound(data, &conn_id, &queue, &config, &out_tx, &mut last_warned, &log).await;
        if !keep_open {
            break;
        }
    }

    poller.abort();
    drop(out_tx);
    let _ = writer.await;

    // Best-effort teardown; failures are logged and the TTLs finish the
    // job eventually.
    if let Err(e) = kv.del(&keys::response(&conn_id)).await {
        slog::warn!(log, "failed to drop response list"; "error" => e.to_string());
    }
    match router.unsubscribe_all(&conn_id).await {
        Ok(removed) => {
            slog::info!(log, "client disconnected"; "subscriptions_removed" => removed);
        }
        Err(e) => {
            slog::warn!(log, "failed to tear down subscriptions"; "error" => e.to_string());
        }
    }
}

/// Classify, push, and translate the outcome. Returns false when the
/// socket should be closed (the breaker-open disconnect path).
async fn handle_inbound(
    data: bytes::Bytes,
    conn_id: &str,
    queue: &ImmortalQueue,
    config: &FrontendConfig,
    out_tx: &mpsc::Sender<Message>,
    last_warned: &mut Option<QueueState>,
    log: &slog::Logger,
) -> bool {
    let send = |message: RelayMessage| {
        let out_tx = out_tx.clone();
        async move { out_tx.send(Message::Text(message.to_frame())).await.is_ok() }
    };

    if data.len() > MAX_FRAME_BYTES {
        return send(RelayMessage::notice("message too large")).await;
    }
    let head = match inspect(&data) {
        Ok(head) => head,
        Err(e) => {
            return send(RelayMessage::notice(&e.to_string())).await;
        }
    };

    let priority = Priority::for_verb(&head.verb);
    let outcome = queue.push(data, conn_id, priority);

    if outcome.accepted {
        match outcome.state {
            QueueState::Healthy => {
                *last_warned = None;
            }
            state if *last_warned != Some(state) => {
                *last_warned = Some(state);
                let warning = match state {
                    QueueState::Degraded => "relay under load, low priority messages are being dropped",
                    QueueState::Overloaded => "relay overloaded, event messages are being dropped",
                    _ => "relay critical, only control messages are being accepted",
                };
                if !send(RelayMessage::notice(warning)).await {
                    return false;
                }
            }
            _ => {}
        }
        return true;
    }

    let reason = outcome.reason.unwrap_or("rejected");
    slog::debug!(
        log,
        "frame rejected";
        "verb" => &head.verb,
        "reason" => reason,
    );
    if !send(rejection_frame(&head, reason)).await {
        return false;
    }

    // A Critical frame bouncing off an open breaker means the relay can
    // not even keep its control plane; ask the client to come back after
    // the cooldown.
    if priority == Priority::Critical && outcome.breaker_tripped() {
        tokio::time::sleep(config.breaker_close_delay).await;
        return false;
    }
    true
}

/// Deliver worker responses to the socket and keep the connection's
/// subscription state alive while it lasts.
async fn poll_responses(
    conn_id: String,
    kv: Arc<dyn KvStore>,
    router: SubscriptionRouter,
    config: FrontendConfig,
    out_tx: mpsc::Sender<Message>,
    log: slog::Logger,
) {
    let resp_key = keys::response(&conn_id);
    let mut timer = tokio::time::interval(config.poll_interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut tick: u32 = 0;

    loop {
        timer.tick().await;
        tick = tick.wrapping_add(1);

        match kv.lpop_count(&resp_key, 100).await {
            Ok(frames) if !frames.is_empty() => {
                if let Err(e) = kv.expire(&resp_key, config.response_ttl).await {
                    slog::debug!(log, "response ttl refresh failed"; "error" => e.to_string());
                }
                for frame in frames {
                    if out_tx.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                slog::debug!(log, "response poll failed"; "error" => e.to_string());
            }
        }

        if tick % config.refresh_every_ticks == 0 {
            if let Err(e) = router.refresh_connection(&conn_id).await {
                slog::debug!(log, "subscription refresh failed"; "error" => e.to_string());
            }
        }
    }
}
