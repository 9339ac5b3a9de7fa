use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;

/// Key layout shared by both sides of the dispatch plane.
pub mod keys {
    /// The single FIFO work list drained by relay workers.
    pub const WORK_LIST: &str = "nostr:work";

    /// Per-connection response list drained by the frontend poller.
    pub fn response(conn_id: &str) -> String {
        format!("resp:{}", conn_id)
    }
}

#[derive(Error, Debug)]
pub enum KvError {
    #[error("store command failed: {0}")]
    Command(#[from] redis::RedisError),
    #[error("store command timed out")]
    Timeout,
    #[error("store value at '{0}' has the wrong type")]
    TypeMismatch(String),
}

/// One step of an atomic batch. The Redis adapter executes a batch as a
/// single MULTI/EXEC pipeline so multi-key updates cannot tear.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    RPush {
        key: String,
        value: String,
    },
}

/// The capability surface the relay needs from the shared key/value
/// service. Implementations must bound every round trip; no call may
/// block longer than about a second.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;
    async fn scard(&self, key: &str) -> Result<u64, KvError>;
    async fn sunion(&self, keys: &[String]) -> Result<Vec<String>, KvError>;

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), KvError>;
    async fn lpop_count(&self, key: &str, count: usize) -> Result<Vec<String>, KvError>;
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, KvError>;
    async fn llen(&self, key: &str) -> Result<u64, KvError>;

    /// Keys matching a `prefix*` pattern. Maintenance sweeps only.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    /// Execute a batch of writes atomically.
    async fn exec_atomic(&self, ops: Vec<KvOp>) -> Result<(), KvError>;
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Redis-backed store over a shared multiplexed connection.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisKv {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<RedisKv, KvError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(RedisKv {
            manager,
            op_timeout,
        })
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> Result<T, KvError> {
        let mut conn = self.manager.clone();
        match tokio::time::timeout(self.op_timeout, cmd.query_async::<_, T>(&mut conn)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KvError::Timeout),
        }
    }

    async fn run_pipe(&self, pipe: redis::Pipeline, timeout: Duration) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        match tokio::time::timeout(timeout, pipe.query_async::<_, ()>(&mut conn)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(KvError::Timeout),
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl_secs(ttl));
        self.run(cmd).await
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs(ttl));
        self.run(cmd).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(member);
        self.run(cmd).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(member);
        self.run(cmd).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn scard(&self, key: &str) -> Result<u64, KvError> {
        let mut cmd = redis::cmd("SCARD");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn sunion(&self, keys: &[String]) -> Result<Vec<String>, KvError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("SUNION");
        cmd.arg(keys);
        self.run(cmd).await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<(), KvError> {
        if values.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(values);
        self.run(cmd).await
    }

    async fn lpop_count(&self, key: &str, count: usize) -> Result<Vec<String>, KvError> {
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(key).arg(count);
        self.run(cmd).await
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, KvError> {
        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(key).arg(timeout.as_secs_f64());
        // The server-side block plus network slack, so a healthy blocking
        // pop is not misreported as a timeout.
        let reply: Option<(String, String)> = {
            let mut conn = self.manager.clone();
            match tokio::time::timeout(
                timeout + self.op_timeout,
                cmd.query_async::<_, Option<(String, String)>>(&mut conn),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(KvError::Timeout),
            }
        };
        Ok(reply.map(|(_, value)| value))
    }

    async fn llen(&self, key: &str) -> Result<u64, KvError> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100);
            let (next, batch): (u64, Vec<String>) = self.run(cmd).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn exec_atomic(&self, ops: Vec<KvOp>) -> Result<(), KvError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                KvOp::SetEx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("EX")
                        .arg(ttl_secs(*ttl))
                        .ignore();
                }
                KvOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                KvOp::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(*ttl)).ignore();
                }
                KvOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                KvOp::SRem { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                KvOp::RPush { key, value } => {
                    pipe.cmd("RPUSH").arg(key).arg(value).ignore();
                }
            }
        }
        self.run_pipe(pipe, self.op_timeout).await
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory double with the same TTL semantics, for exercising the
    //! router and dispatch plane without a live server.

    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;

    #[derive(Debug)]
    enum StoredValue {
        Text(String),
        Set(HashSet<String>),
        List(VecDeque<String>),
    }

    #[derive(Debug)]
    struct Entry {
        value: StoredValue,
        expires_at: Option<Instant>,
    }

    #[derive(Default)]
    pub struct MemoryKv {
        entries: Mutex<HashMap<String, Entry>>,
    }

    impl MemoryKv {
        pub fn new() -> MemoryKv {
            MemoryKv::default()
        }

        /// Remaining TTL of a key, for TTL-discipline assertions.
        pub fn ttl_of(&self, key: &str) -> Option<Duration> {
            let now = Instant::now();
            let entries = self.entries.lock().unwrap();
            entries
                .get(key)
                .and_then(|e| e.expires_at)
                .and_then(|at| at.checked_duration_since(now))
        }

        pub fn contains(&self, key: &str) -> bool {
            let mut entries = self.entries.lock().unwrap();
            prune(&mut entries, key);
            entries.contains_key(key)
        }

        fn apply(entries: &mut HashMap<String, Entry>, op: &KvOp) -> Result<(), KvError> {
            let now = Instant::now();
            match op {
                KvOp::SetEx { key, value, ttl } => {
                    entries.insert(
                        key.clone(),
                        Entry {
                            value: StoredValue::Text(value.clone()),
                            expires_at: Some(now + *ttl),
                        },
                    );
                }
                KvOp::Del { key } => {
                    entries.remove(key);
                }
                KvOp::Expire { key, ttl } => {
                    if let Some(entry) = entries.get_mut(key) {
                        entry.expires_at = Some(now + *ttl);
                    }
                }
                KvOp::SAdd { key, member } => {
                    let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                        value: StoredValue::Set(HashSet::new()),
                        expires_at: None,
                    });
                    match &mut entry.value {
                        StoredValue::Set(set) => {
                            set.insert(member.clone());
                        }
                        _ => return Err(KvError::TypeMismatch(key.clone())),
                    }
                }
                KvOp::SRem { key, member } => {
                    let mut emptied = false;
                    if let Some(entry) = entries.get_mut(key) {
                        match &mut entry.value {
                            StoredValue::Set(set) => {
                                set.remove(member);
                                emptied = set.is_empty();
                            }
                            _ => return Err(KvError::TypeMismatch(key.clone())),
                        }
                    }
                    // Redis removes a set key when its last member goes.
                    if emptied {
                        entries.remove(key);
                    }
                }
                KvOp::RPush { key, value } => {
                    let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                        value: StoredValue::List(VecDeque::new()),
                        expires_at: None,
                    });
                    match &mut entry.value {
                        StoredValue::List(list) => list.push_back(value.clone()),
                        _ => return Err(KvError::TypeMismatch(key.clone())),
                    }
                }
            }
            Ok(())
        }
    }

    fn prune(entries: &mut HashMap<String, Entry>, key: &str) {
        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at <= Instant::now())
            .unwrap_or(false);
        if expired {
            entries.remove(key);
        }
    }

    #[async_trait]
    impl KvStore for MemoryKv {
        async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
            let mut entries = self.entries.lock().unwrap();
            prune(&mut entries, key);
            match entries.get(key) {
                Some(Entry {
                    value: StoredValue::Text(s),
                    ..
                }) => Ok(Some(s.clone())),
                Some(_) => Err(KvError::TypeMismatch(key.to_owned())),
                None => Ok(None),
            }
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
            let mut entries = self.entries.lock().unwrap();
            MemoryKv::apply(
                &mut entries,
                &KvOp::SetEx {
                    key: key.to_owned(),
                    value: value.to_owned(),
                    ttl,
                },
            )
        }

        async fn del(&self, key: &str) -> Result<(), KvError> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
            let mut entries = self.entries.lock().unwrap();
            MemoryKv::apply(
                &mut entries,
                &KvOp::Expire {
                    key: key.to_owned(),
                    ttl,
                },
            )
        }

        async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
            let mut entries = self.entries.lock().unwrap();
            MemoryKv::apply(
                &mut entries,
                &KvOp::SAdd {
                    key: key.to_owned(),
                    member: member.to_owned(),
                },
            )
        }

        async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
            let mut entries = self.entries.lock().unwrap();
            MemoryKv::apply(
                &mut entries,
                &KvOp::SRem {
                    key: key.to_owned(),
                    member: member.to_owned(),
                },
            )
        }

        async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
            let mut entries = self.entries.lock().unwrap();
            prune(&mut entries, key);
            match entries.get(key) {
                Some(Entry {
                    value: StoredValue::Set(set),
                    ..
                }) => Ok(set.iter().cloned().collect()),
                Some(_) => Err(KvError::TypeMismatch(key.to_owned())),
                None => Ok(Vec::new()),
            }
        }

        async fn scard(&self, key: &str) -> Result<u64, KvError> {
            Ok(self.smembers(key).await?.len() as u64)
        }

        async fn sunion(&self, keys: &[String]) -> Result<Vec<String>, KvError> {
            let mut union = HashSet::new();
            for key in keys {
                union.extend(self.smembers(key).await?);
            }
            Ok(union.into_iter().collect())
        }

        async fn rpush(&self, key: &str, values: &[String]) -> Result<(), KvError> {
            let mut entries = self.entries.lock().unwrap();
            for value in values {
                MemoryKv::apply(
                    &mut entries,
                    &KvOp::RPush {
                        key: key.to_owned(),
                        value: value.clone(),
                    },
                )?;
            }
            Ok(())
        }

        async fn lpop_count(&self, key: &str, count: usize) -> Result<Vec<String>, KvError> {
            let mut entries = self.entries.lock().unwrap();
            prune(&mut entries, key);
            let mut out = Vec::new();
            let mut emptied = false;
            if let Some(entry) = entries.get_mut(key) {
                match &mut entry.value {
                    StoredValue::List(list) => {
                        while out.len() < count {
                            match list.pop_front() {
                                Some(v) => out.push(v),
                                None => break,
                            }
                        }
                        emptied = list.is_empty();
                    }
                    _ => return Err(KvError::TypeMismatch(key.to_owned())),
                }
            }
            if emptied {
                entries.remove(key);
            }
            Ok(out)
        }

        async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, KvError> {
            let deadline = Instant::now() + timeout;
            loop {
                let popped = self.lpop_count(key, 1).await?;
                if let Some(value) = popped.into_iter().next() {
                    return Ok(Some(value));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn llen(&self, key: &str) -> Result<u64, KvError> {
            let mut entries = self.entries.lock().unwrap();
            prune(&mut entries, key);
            match entries.get(key) {
                Some(Entry {
                    value: StoredValue::List(list),
                    ..
                }) => Ok(list.len() as u64),
                Some(_) => Err(KvError::TypeMismatch(key.to_owned())),
                None => Ok(0),
            }
        }

        async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
            let entries = self.entries.lock().unwrap();
            let matches = |key: &str| match pattern.strip_suffix('*') {
                Some(prefix) => key.starts_with(prefix),
                None => key == pattern,
            };
            Ok(entries.keys().filter(|k| matches(k)).cloned().collect())
        }

        async fn exec_atomic(&self, ops: Vec<KvOp>) -> Result<(), KvError> {
            let mut entries = self.entries.lock().unwrap();
            for op in &ops {
                MemoryKv::apply(&mut entries, op)?;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn ttl_expiry_is_observed() {
            let kv = MemoryKv::new();
            kv.set_ex("k", "v", Duration::from_millis(20)).await.unwrap();
            assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(kv.get("k").await.unwrap(), None);
        }

        #[tokio::test]
        async fn sets_vanish_when_emptied() {
            let kv = MemoryKv::new();
            kv.sadd("s", "a").await.unwrap();
            assert_eq!(kv.scard("s").await.unwrap(), 1);
            kv.srem("s", "a").await.unwrap();
            assert!(!kv.contains("s"));
        }

        #[tokio::test]
        async fn atomic_batch_applies_in_order() {
            let kv = MemoryKv::new();
            kv.exec_atomic(vec![
                KvOp::RPush {
                    key: "l".to_owned(),
                    value: "1".to_owned(),
                },
                KvOp::RPush {
                    key: "l".to_owned(),
                    value: "2".to_owned(),
                },
                KvOp::Expire {
                    key: "l".to_owned(),
                    ttl: Duration::from_secs(5),
                },
            ])
            .await
            .unwrap();
            assert_eq!(kv.llen("l").await.unwrap(), 2);
            assert!(kv.ttl_of("l").is_some());
            assert_eq!(
                kv.lpop_count("l", 10).await.unwrap(),
                vec!["1".to_owned(), "2".to_owned()]
            );
        }

        #[tokio::test]
        async fn blpop_times_out_cleanly() {
            let kv = MemoryKv::new();
            let got = kv.blpop("missing", Duration::from_millis(20)).await.unwrap();
            assert_eq!(got, None);
        }
    }
}
