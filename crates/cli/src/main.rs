//! Operator CLI for job deduplication records.
//!
//! `jobguard key` prints the keys a job would use; `jobguard inspect` reads
//! the live records for that job from Redis.

use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value as JsonValue;

use jobguard_core::{IdempotencyKey, IdempotencyKeyCodec, DEFAULT_QUEUE};
use jobguard_infra::{BatchOp, DedupConfig, KeyStore, RedisKeyStore};
use jobguard_observability::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "jobguard")]
#[command(about = "Inspect job deduplication records")]
#[command(version)]
struct Args {
    /// Key namespace (defaults to JOBGUARD_NAMESPACE or "jobguard")
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Output in JSON format instead of plain text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the record keys for a job
    Key(JobArgs),
    /// Read the live records for a job from Redis
    Inspect {
        #[command(flatten)]
        job: JobArgs,
        /// Redis URL (defaults to JOBGUARD_REDIS_URL / REDIS_URL)
        #[arg(long)]
        redis_url: Option<String>,
    },
}

#[derive(ClapArgs, Debug)]
struct JobArgs {
    /// Worker type
    #[arg(long, short = 'w')]
    worker: String,
    /// Queue the job is routed to
    #[arg(long, short = 'q', default_value = DEFAULT_QUEUE)]
    queue: String,
    /// Job arguments as a JSON array
    #[arg(long, default_value = "[]")]
    args: String,
    /// Database config with WAL tracking (repeatable)
    #[arg(long = "wal-config")]
    wal_configs: Vec<String>,
}

impl JobArgs {
    fn key(&self, namespace: &str) -> anyhow::Result<IdempotencyKey> {
        let args: Vec<JsonValue> = serde_json::from_str(&self.args)
            .with_context(|| format!("--args must be a JSON array, got {}", self.args))?;
        let digest = IdempotencyKeyCodec::compute(&self.worker, &args);
        Ok(IdempotencyKey::new(namespace, &self.queue, &digest))
    }
}

#[derive(Serialize, Debug)]
struct KeyReport {
    key: String,
    deduplicate_flag: String,
    wal_configs: String,
    wal: BTreeMap<String, WalKeys>,
}

#[derive(Serialize, Debug)]
struct WalKeys {
    existing_wal_location: String,
    wal_location: String,
}

#[derive(Serialize, Debug)]
struct InspectReport {
    key: String,
    winner: Option<String>,
    reschedule_pending: bool,
    existing_wal_locations: BTreeMap<String, Option<String>>,
    latest_wal_locations: BTreeMap<String, Option<String>>,
}

fn key_report(key: &IdempotencyKey, configs: &[String]) -> KeyReport {
    KeyReport {
        key: key.to_string(),
        deduplicate_flag: key.deduplicated_flag_key(),
        wal_configs: key.wal_configs_key(),
        wal: configs
            .iter()
            .map(|config| {
                let keys = WalKeys {
                    existing_wal_location: key.existing_wal_location_key(config),
                    wal_location: key.wal_location_key(config),
                };
                (config.clone(), keys)
            })
            .collect(),
    }
}

fn inspect(
    store: &impl KeyStore,
    key: &IdempotencyKey,
    configs: &[String],
) -> anyhow::Result<InspectReport> {
    let mut ops = vec![
        BatchOp::Get {
            key: key.to_string(),
        },
        BatchOp::Get {
            key: key.deduplicated_flag_key(),
        },
    ];
    for config in configs {
        ops.push(BatchOp::Get {
            key: key.existing_wal_location_key(config),
        });
        ops.push(BatchOp::ListIndex {
            key: key.wal_location_key(config),
            index: 0,
        });
    }

    let mut replies = store
        .batch(&ops)
        .context("reading deduplication records")?
        .into_iter()
        .map(|reply| reply.into_value());
    let mut next = || -> anyhow::Result<Option<String>> {
        Ok(replies.next().context("truncated reply")??)
    };

    let winner = next()?;
    let reschedule_pending = next()?.is_some();
    let mut existing_wal_locations = BTreeMap::new();
    let mut latest_wal_locations = BTreeMap::new();
    for config in configs {
        existing_wal_locations.insert(config.clone(), next()?);
        latest_wal_locations.insert(config.clone(), next()?);
    }

    Ok(InspectReport {
        key: key.to_string(),
        winner,
        reschedule_pending,
        existing_wal_locations,
        latest_wal_locations,
    })
}

fn print_key_report(report: &KeyReport) {
    println!("key:              {}", report.key);
    println!("deduplicate_flag: {}", report.deduplicate_flag);
    println!("wal_configs:      {}", report.wal_configs);
    for (config, keys) in &report.wal {
        println!("[{config}]");
        println!("  existing_wal_location: {}", keys.existing_wal_location);
        println!("  wal_location:          {}", keys.wal_location);
    }
}

fn print_inspect_report(report: &InspectReport) {
    let show = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

    println!("key:                {}", report.key);
    println!("winner:             {}", show(&report.winner));
    println!("reschedule pending: {}", report.reschedule_pending);
    for config in report.existing_wal_locations.keys() {
        println!("[{config}]");
        println!("  existing: {}", show(&report.existing_wal_locations[config]));
        println!("  latest:   {}", show(&report.latest_wal_locations[config]));
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = DedupConfig::from_env().context("loading configuration")?;
    if let Some(namespace) = args.namespace {
        config = config.with_namespace(namespace);
    }

    match args.command {
        Command::Key(job) => {
            let key = job.key(&config.namespace)?;
            let report = key_report(&key, &job.wal_configs);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_key_report(&report);
            }
        }
        Command::Inspect { job, redis_url } => {
            let key = job.key(&config.namespace)?;
            let url = redis_url.unwrap_or(config.redis_url);
            let store = RedisKeyStore::new(&url)
                .with_context(|| format!("connecting to {url}"))?
                .with_request_timeout(config.request_timeout);

            tracing::debug!(key = %key, url = %url, "inspecting");
            let report = inspect(&store, &key, &job.wal_configs)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_inspect_report(&report);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    jobguard_observability::tracing::init_with(LogFormat::Compact, "warn");

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
