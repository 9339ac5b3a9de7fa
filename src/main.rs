use std::sync::Arc;
use std::time::Duration;

use git_version::git_version;
use slog::*;
use structopt::StructOpt;

use crate::event::Secp256k1Verifier;
use crate::kv::{KvStore, RedisKv};
use crate::pubsub::SubscriptionRouter;
use crate::queue::{ImmortalQueue, QueueConfig};
use crate::storage::MemoryStore;

mod bridge;
mod event;
mod frontend;
mod kv;
mod proto;
mod pubsub;
mod queue;
mod storage;
mod subscription;
mod worker;

#[derive(Debug, StructOpt)]
#[structopt(name = "drayage", about = "A multi-process relay for the Nostr protocol.")]
struct Opt {
    /// The path of the configuration file.
    #[structopt(
        short = "c",
        long = "config",
        default_value = "/etc/drayage/config.yml"
    )]
    config: std::path::PathBuf,

    /// Show debug log information
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    #[structopt(subcommand)]
    role: Role,
}

#[derive(Debug, StructOpt)]
enum Role {
    /// Accept websocket clients, run the ingress queue, and feed the
    /// shared work list.
    Frontend,
    /// Consume the shared work list, store events, and fan matches out to
    /// subscribers. Run as many of these as the load needs.
    Worker,
}

mod config {
    use std::time::Duration;

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Version {
        pub version: Option<i16>,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1 {
        pub listen: String,
        pub store_url: String,
        pub queue: V1Queue,
        #[serde(with = "humantime_serde")]
        pub response_poll_interval: Duration,
        #[serde(with = "humantime_serde")]
        pub response_ttl: Duration,
        #[serde(with = "humantime_serde")]
        pub subscription_ttl: Duration,
        #[serde(with = "humantime_serde")]
        pub index_ttl: Duration,
        pub bridge_batch: usize,
        pub worker_batch: usize,
        #[serde(with = "humantime_serde")]
        pub queue_sweep_interval: Duration,
        #[serde(with = "humantime_serde")]
        pub queue_message_max_age: Duration,
        #[serde(with = "humantime_serde")]
        pub index_sweep_interval: Duration,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct V1Queue {
        pub capacity: usize,
        pub rate_limit: u32,
        #[serde(with = "humantime_serde")]
        pub rate_window: Duration,
        pub breaker_threshold: f64,
        #[serde(with = "humantime_serde")]
        pub breaker_cooldown: Duration,
    }

    // An internal configuration structure used by the rest of the program
    // that can be updated without breaking compatibility with existing
    // configuration files.
    #[derive(Debug)]
    pub struct Internal {
        pub listen: String,
        pub store_url: String,
        pub queue_capacity: usize,
        pub rate_limit: u32,
        pub rate_window: Duration,
        pub breaker_threshold: f64,
        pub breaker_cooldown: Duration,
        pub response_poll_interval: Duration,
        pub response_ttl: Duration,
        pub subscription_ttl: Duration,
        pub index_ttl: Duration,
        pub bridge_batch: usize,
        pub worker_batch: usize,
        pub queue_sweep_interval: Duration,
        pub queue_message_max_age: Duration,
        pub index_sweep_interval: Duration,
    }
}

#[tokio::main]
async fn main() {
    // Find and store build version information
    const GIT_VERSION: &str = git_version!(
        args = ["--long", "--all", "--always", "--dirty=-modified"],
        fallback = "unknown"
    );

    // Parse input arguments
    let opt = Opt::from_args();

    // Setup slog terminal logging
    let log_decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(log_decorator).build().fuse();

    let mut log_level = Level::Info;
    if opt.verbose {
        log_level = Level::Debug;
    }

    let drain = slog::LevelFilter::new(drain, log_level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    let root_log = slog::Logger::root(
        drain.fuse(),
        slog::o!("build" => GIT_VERSION,
        "pkg-version" => env!("CARGO_PKG_VERSION"),
        ),
    );

    slog::info!(root_log, "Arguments {:?}", opt);

    // Read the configuration file
    let config_string = std::fs::read_to_string(&opt.config).expect("Failed to read config file");
    let parsed_config_version: config::Version =
        serde_yaml::from_str(&config_string).expect("Failed to extract version from config file");
    slog::debug!(
        root_log,
        "Parsed the config version {:?}",
        parsed_config_version
    );
    let config_version = parsed_config_version.version.unwrap_or(1);

    let config = match config_version {
        1 => {
            let parsed_config: config::V1 =
                serde_yaml::from_str(&config_string).expect("Failed to parse config");
            slog::debug!(root_log, "Parsed config {:?}", parsed_config);
            config::Internal {
                listen: parsed_config.listen,
                store_url: parsed_config.store_url,
                queue_capacity: parsed_config.queue.capacity,
                rate_limit: parsed_config.queue.rate_limit,
                rate_window: parsed_config.queue.rate_window,
                breaker_threshold: parsed_config.queue.breaker_threshold,
                breaker_cooldown: parsed_config.queue.breaker_cooldown,
                response_poll_interval: parsed_config.response_poll_interval,
                response_ttl: parsed_config.response_ttl,
                subscription_ttl: parsed_config.subscription_ttl,
                index_ttl: parsed_config.index_ttl,
                bridge_batch: parsed_config.bridge_batch,
                worker_batch: parsed_config.worker_batch,
                queue_sweep_interval: parsed_config.queue_sweep_interval,
                queue_message_max_age: parsed_config.queue_message_max_age,
                index_sweep_interval: parsed_config.index_sweep_interval,
            }
        }
        _ => {
            slog::error!(
                root_log,
                "Unsupported configuration version '{}' specified",
                config_version
            );
            panic!("Unsupported configuration version specified");
        }
    };

    let config = Arc::new(config);

    // Connect to the shared store that carries the work list, the
    // response lists, and the subscription index.
    let kv = RedisKv::connect(&config.store_url, Duration::from_secs(1));
    let kv = tokio::time::timeout(Duration::from_secs(5), kv)
        .await
        .expect("Store connection timed out")
        .unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(kv);
    slog::info!(
        root_log,
        "Connected to shared store";
        "url" => &config.store_url,
        "subscription_ttl" => humantime::format_duration(config.subscription_ttl).to_string(),
        "index_ttl" => humantime::format_duration(config.index_ttl).to_string(),
    );

    let router = SubscriptionRouter::new(
        Arc::clone(&kv),
        config.subscription_ttl,
        config.index_ttl,
        root_log.new(o!("subsystem" => "pubsub")),
    );

    match opt.role {
        Role::Frontend => run_frontend(config, kv, router, root_log).await,
        Role::Worker => run_worker(config, kv, router, root_log).await,
    }
}

async fn run_frontend(
    config: Arc<config::Internal>,
    kv: Arc<dyn KvStore>,
    router: SubscriptionRouter,
    root_log: Logger,
) {
    let queue = Arc::new(ImmortalQueue::new(QueueConfig {
        capacity: config.queue_capacity,
        rate_limit: config.rate_limit,
        rate_window: config.rate_window,
        breaker_threshold: config.breaker_threshold,
        breaker_cooldown: config.breaker_cooldown,
    }));

    // The bridge shares the ingress queue with the acceptor, so it lives
    // in this process as its own task.
    tokio::task::spawn(bridge::drain_loop(
        Arc::clone(&queue),
        Arc::clone(&kv),
        bridge::BridgeConfig {
            batch: config.bridge_batch,
            ..bridge::BridgeConfig::default()
        },
        root_log.new(o!("subsystem" => "bridge")),
    ));

    // Periodic queue housekeeping: expire stale messages and surface the
    // counters through the log.
    {
        let queue = Arc::clone(&queue);
        let log = root_log.new(o!("subsystem" => "queue_sweep"));
        let sweep_interval = config.queue_sweep_interval;
        let max_age = config.queue_message_max_age;
        tokio::task::spawn(async move {
            let mut timer = tokio::time::interval_at(
                tokio::time::Instant::now() + sweep_interval,
                sweep_interval,
            );
            loop {
                timer.tick().await;
                let expired = queue.cleanup(max_age);
                let stats = queue.stats();
                slog::info!(
                    log,
                    "queue stats";
                    "length" => stats.length,
                    "capacity" => stats.capacity,
                    "state" => format!("{:?}", stats.state),
                    "processed" => stats.processed,
                    "dropped" => stats.dropped,
                    "expired" => expired,
                    "breaker_trips" => stats.breaker_trips,
                    "connections" => stats.tracked_connections,
                    "mean_pop_latency" => stats
                        .mean_pop_latency
                        .map(|d| format!("{:?}", d))
                        .unwrap_or_else(|| "n/a".to_owned()),
                );
            }
        });
    }

    let fe_config = frontend::FrontendConfig {
        listen: config.listen.clone(),
        poll_interval: config.response_poll_interval,
        response_ttl: config.response_ttl,
        ..frontend::FrontendConfig::default()
    };
    frontend::run(
        fe_config,
        queue,
        kv,
        router,
        root_log.new(o!("subsystem" => "frontend")),
    )
    .await
    .unwrap_or_else(|e| {
        slog::crit!(root_log, "Frontend failed"; "error" => e.to_string());
        panic!("Frontend failed: {}", e);
    });
}

async fn run_worker(
    config: Arc<config::Internal>,
    kv: Arc<dyn KvStore>,
    router: SubscriptionRouter,
    root_log: Logger,
) {
    // Reclaim index sets that lost their last member without being
    // deleted, e.g. after a torn teardown.
    {
        let router = router.clone();
        let log = root_log.new(o!("subsystem" => "index_sweep"));
        let sweep_interval = config.index_sweep_interval;
        tokio::task::spawn(async move {
            let mut timer = tokio::time::interval_at(
                tokio::time::Instant::now() + sweep_interval,
                sweep_interval,
            );
            loop {
                timer.tick().await;
                match router.cleanup_empty_indexes().await {
                    Ok(_) => {}
                    Err(e) => {
                        slog::warn!(log, "index sweep failed"; "error" => e.to_string());
                    }
                }
            }
        });
    }

    // The storage engine rides behind the EventStore trait; the stock
    // binary ships the in-memory backend.
    let worker = worker::RelayWorker::new(
        kv,
        Arc::new(MemoryStore::new()),
        Arc::new(Secp256k1Verifier::new()),
        router,
        worker::WorkerConfig {
            batch: config.worker_batch,
            pop_timeout: Duration::from_secs(1),
            response_ttl: config.response_ttl,
        },
        root_log.new(o!("subsystem" => "worker")),
    );
    worker.run().await;
}
