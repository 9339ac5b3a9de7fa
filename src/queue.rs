use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admission band for an inbound frame. Control-plane verbs ride the
/// higher bands so a flood of events cannot starve CLOSE or AUTH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    fn bucket(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

/// Queue health derived from utilization. The stepped thresholds are part
/// of the admission contract: Degraded sheds Low, Overloaded sheds Low and
/// Normal, Critical admits only Critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Healthy,
    Degraded,
    Overloaded,
    Critical,
}

impl QueueState {
    fn from_utilization(u: f64) -> QueueState {
        if u >= 0.95 {
            QueueState::Critical
        } else if u >= 0.8 {
            QueueState::Overloaded
        } else if u >= 0.5 {
            QueueState::Degraded
        } else {
            QueueState::Healthy
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: bytes::Bytes,
    pub conn_id: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
}

/// Outcome of a push. Pushing never fails and never blocks; overload is
/// expressed entirely through `accepted` and `reason`.
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub accepted: bool,
    pub reason: Option<&'static str>,
    pub state: QueueState,
}

impl PushOutcome {
    /// True when the rejection came from the circuit breaker, open or
    /// freshly tripped.
    pub fn breaker_tripped(&self) -> bool {
        self.reason == Some(REASON_BREAKER)
    }
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub length: usize,
    pub capacity: usize,
    pub state: QueueState,
    pub processed: u64,
    pub dropped: u64,
    pub breaker_open: bool,
    pub breaker_trips: u64,
    pub tracked_connections: usize,
    pub mean_pop_latency: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub breaker_threshold: f64,
    pub breaker_cooldown: Duration,
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            capacity: 10_000,
            rate_limit: 100,
            rate_window: Duration::from_millis(1000),
            breaker_threshold: 0.95,
            breaker_cooldown: Duration::from_secs(5),
        }
    }
}

const REASON_BREAKER: &str = "circuit breaker open";
const REASON_RATE: &str = "rate limited";
const REASON_LOW_DROPPED: &str = "low priority dropped";
const REASON_NORMAL_DROPPED: &str = "normal priority dropped";
const REASON_HIGH_DROPPED: &str = "high priority dropped";
const REASON_CAPACITY: &str = "queue at capacity";

const LATENCY_RING_LEN: usize = 1000;

#[derive(Debug)]
struct RateCounter {
    count: u32,
    window_start: Instant,
    blocked: bool,
}

#[derive(Debug)]
struct Inner {
    buckets: [VecDeque<QueuedMessage>; 4],
    length: usize,
    capacity: usize,
    rate_limit: u32,
    rate_window: Duration,
    rates: HashMap<String, RateCounter>,
    breaker_threshold: f64,
    breaker_cooldown: Duration,
    breaker_open_until: Option<Instant>,
    processed: u64,
    dropped: u64,
    breaker_trips: u64,
    pop_latencies: VecDeque<Duration>,
}

/// The ingress queue. All state sits behind a single mutex; every
/// operation is O(1)-ish and synchronous, so the lock is only ever held
/// briefly and nothing here can suspend.
#[derive(Debug)]
pub struct ImmortalQueue {
    inner: Mutex<Inner>,
}

impl ImmortalQueue {
    pub fn new(config: QueueConfig) -> ImmortalQueue {
        ImmortalQueue {
            inner: Mutex::new(Inner {
                buckets: [
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                    VecDeque::new(),
                ],
                length: 0,
                capacity: config.capacity,
                rate_limit: config.rate_limit,
                rate_window: config.rate_window,
                rates: HashMap::new(),
                breaker_threshold: config.breaker_threshold,
                breaker_cooldown: config.breaker_cooldown,
                breaker_open_until: None,
                processed: 0,
                dropped: 0,
                breaker_trips: 0,
                pop_latencies: VecDeque::with_capacity(LATENCY_RING_LEN),
            }),
        }
    }

    /// Admit or reject a frame. Admission order: circuit breaker, rate
    /// limit, priority gate, hard capacity.
    pub fn push(&self, payload: bytes::Bytes, conn_id: &str, priority: Priority) -> PushOutcome {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let utilization = inner.utilization();
        let state = QueueState::from_utilization(utilization);

        // Circuit breaker. A trip drops the triggering message too, and the
        // breaker only re-closes once the cooldown has fully elapsed.
        match inner.breaker_open_until {
            Some(until) if now < until => {
                inner.dropped += 1;
                return PushOutcome {
                    accepted: false,
                    reason: Some(REASON_BREAKER),
                    state,
                };
            }
            Some(_) => {
                inner.breaker_open_until = None;
            }
            None => {}
        }
        if utilization > inner.breaker_threshold {
            inner.breaker_open_until = Some(now + inner.breaker_cooldown);
            inner.breaker_trips += 1;
            inner.dropped += 1;
            return PushOutcome {
                accepted: false,
                reason: Some(REASON_BREAKER),
                state,
            };
        }

        // Per-connection fixed window.
        let rate_limit = inner.rate_limit;
        let rate_window = inner.rate_window;
        let counter = inner
            .rates
            .entry(conn_id.to_owned())
            .or_insert_with(|| RateCounter {
                count: 0,
                window_start: now,
                blocked: false,
            });
        if now.duration_since(counter.window_start) >= rate_window {
            counter.count = 0;
            counter.window_start = now;
            counter.blocked = false;
        }
        if counter.count >= rate_limit {
            counter.blocked = true;
            inner.dropped += 1;
            return PushOutcome {
                accepted: false,
                reason: Some(REASON_RATE),
                state,
            };
        }
        counter.count += 1;

        // Priority gate keyed on the state computed at entry.
        let gate_reason = match (state, priority) {
            (QueueState::Healthy, _) => None,
            (QueueState::Degraded, Priority::Low) => Some(REASON_LOW_DROPPED),
            (QueueState::Degraded, _) => None,
            (QueueState::Overloaded, Priority::Low) => Some(REASON_LOW_DROPPED),
            (QueueState::Overloaded, Priority::Normal) => Some(REASON_NORMAL_DROPPED),
            (QueueState::Overloaded, _) => None,
            (QueueState::Critical, Priority::Critical) => None,
            (QueueState::Critical, Priority::High) => Some(REASON_HIGH_DROPPED),
            (QueueState::Critical, Priority::Normal) => Some(REASON_NORMAL_DROPPED),
            (QueueState::Critical, Priority::Low) => Some(REASON_LOW_DROPPED),
        };
        if let Some(reason) = gate_reason {
            inner.dropped += 1;
            return PushOutcome {
                accepted: false,
                reason: Some(reason),
                state,
            };
        }

        // Hard capacity check runs last so its reason only surfaces when
        // the breaker threshold sits at or above 1.0.
        if inner.length >= inner.capacity {
            inner.dropped += 1;
            return PushOutcome {
                accepted: false,
                reason: Some(REASON_CAPACITY),
                state,
            };
        }

        inner.buckets[priority.bucket()].push_back(QueuedMessage {
            payload,
            conn_id: conn_id.to_owned(),
            priority,
            enqueued_at: now,
        });
        inner.length += 1;

        PushOutcome {
            accepted: true,
            reason: None,
            state,
        }
    }

    /// Return up to `n` messages, draining the highest non-empty bucket
    /// first. Partial batches are returned rather than waiting.
    pub fn pop(&self, n: usize) -> Vec<QueuedMessage> {
        let start = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for bucket in 0..inner.buckets.len() {
            while out.len() < n {
                match inner.buckets[bucket].pop_front() {
                    Some(msg) => out.push(msg),
                    None => break,
                }
            }
            if out.len() >= n {
                break;
            }
        }
        inner.length -= out.len();
        inner.processed += out.len() as u64;

        if inner.pop_latencies.len() >= LATENCY_RING_LEN {
            inner.pop_latencies.pop_front();
        }
        inner.pop_latencies.push_back(start.elapsed());

        out
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().length
    }

    pub fn utilization(&self) -> f64 {
        self.inner.lock().unwrap().utilization()
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_utilization(self.utilization())
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let mean = if inner.pop_latencies.is_empty() {
            None
        } else {
            let total: Duration = inner.pop_latencies.iter().sum();
            Some(total / inner.pop_latencies.len() as u32)
        };
        QueueStats {
            length: inner.length,
            capacity: inner.capacity,
            state: QueueState::from_utilization(inner.utilization()),
            processed: inner.processed,
            dropped: inner.dropped,
            breaker_open: inner
                .breaker_open_until
                .map(|until| Instant::now() < until)
                .unwrap_or(false),
            breaker_trips: inner.breaker_trips,
            tracked_connections: inner.rates.len(),
            mean_pop_latency: mean,
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().unwrap().capacity = capacity;
    }

    pub fn set_rate_limit(&self, limit: u32, window: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.rate_limit = limit;
        inner.rate_window = window;
    }

    pub fn reset_circuit_breaker(&self) {
        self.inner.lock().unwrap().breaker_open_until = None;
    }

    /// Drop messages older than `max_age` and forget rate counters whose
    /// window is long past. Returns the number of expired messages.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;
        for bucket in inner.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|msg| now.duration_since(msg.enqueued_at) < max_age);
            removed += before - bucket.len();
        }
        inner.length -= removed;
        inner.dropped += removed as u64;

        let window = inner.rate_window;
        inner
            .rates
            .retain(|_, c| now.duration_since(c.window_start) < window * 2);

        removed
    }
}

impl Inner {
    fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.length as f64 / self.capacity as f64
    }
}
