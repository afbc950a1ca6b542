//! The metrics-agent binary: argument parsing, configuration loading, and
//! the two run modes. One-shot mode makes a single collection pass over the
//! selected hosts; scheduler mode runs the interval workers forever and
//! refreshes the inventory in the background.

mod logging;

use anyhow::Context;
use catalog::{shard_host_list, HostManager, Inventory, InventorySource, ShardSpec};
use clap::Parser;
use collection::session::SessionOptions;
use collection::{
    Collect, CollectRequest, Collector, CollectorOptions, Scheduler, SchedulerOptions,
    MEASUREMENT_PREFIX,
};
use parsers::ParserRegistry;
use points::{now_ns, Output, OutputKind, Point};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputType {
    Stdout,
    Http,
}

#[derive(Debug, Parser)]
#[command(name = "metrics-agent", version, about = "Collect metrics from a fleet of network devices")]
struct Args {
    /// Hosts file in yaml, or a dynamic inventory executable
    #[arg(long, default_value = "hosts.yaml")]
    hosts: PathBuf,

    /// Credentials file in yaml
    #[arg(long, default_value = "credentials.yaml")]
    credentials: PathBuf,

    /// Commands file in yaml (multi-document; the first document counts)
    #[arg(long, default_value = "commands.yaml")]
    commands: PathBuf,

    /// Directory where to find parser definitions
    #[arg(long, default_value = "parsers")]
    parserdir: PathBuf,

    /// Collect from hosts matching these tags
    #[arg(long = "tag", num_args = 1..)]
    tag: Vec<String>,

    /// Collect only commands matching these tags
    #[arg(long = "cmd-tag", num_args = 1..)]
    cmd_tag: Vec<String>,

    /// Shard assignment as <id>/<size>, 1-based
    #[arg(long)]
    sharding: Option<String>,

    /// Shift the shard id by one (for schedulers numbering from zero)
    #[arg(long)]
    sharding_offset: bool,

    /// Run the interval scheduler instead of a one-shot pass
    #[arg(long)]
    use_scheduler: bool,

    /// Maximum number of collector threads to spawn
    #[arg(long, default_value_t = 10)]
    nbr_collector_threads: usize,

    /// Collect sequentially instead of spawning collector threads
    #[arg(long)]
    no_collector_threads: bool,

    /// Maximum number of worker threads per interval
    #[arg(long, default_value_t = 1)]
    max_worker_threads: usize,

    /// Seconds between inventory refreshes in scheduler mode
    #[arg(long, default_value_t = 3 * 60 * 60)]
    hosts_refresh_interval: u64,

    #[arg(long, value_enum, default_value = "stdout")]
    output_type: OutputType,

    /// Address for the http output
    #[arg(long, default_value = "http://localhost:8186/write")]
    output_addr: String,

    /// Start collecting (default no)
    #[arg(long, short = 's')]
    start: bool,

    /// Logs verbosity: 10 debug, 20 info, 30 warn, 40+ error
    #[arg(long, default_value_t = 20)]
    loglvl: u8,

    #[arg(long, value_enum)]
    log_format: Option<logging::LogFormat>,

    /// Per-operation device timeout in seconds
    #[arg(long, default_value_t = 600)]
    timeout: u64,

    /// Connection attempts per device
    #[arg(long, default_value_t = 5)]
    retry: u32,

    /// Reference devices by their reported hostname instead of the
    /// inventory key
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    usehostname: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.loglvl, args.log_format);

    if !args.start {
        println!("Missing <start> option, so nothing to do");
        return Ok(());
    }
    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    let time_start = Instant::now();

    let host_tags = or_match_all(&args.tag);
    let cmd_tags = or_match_all(&args.cmd_tag);

    let shard = args
        .sharding
        .as_deref()
        .map(|raw| ShardSpec::parse(raw, args.sharding_offset))
        .transpose()
        .context("invalid --sharding parameter")?;

    tracing::info!(path = %args.credentials.display(), "importing credentials file");
    let credentials_raw = std::fs::read_to_string(&args.credentials)
        .with_context(|| format!("cannot read {}", args.credentials.display()))?;
    let credentials = serde_yaml::from_str(&credentials_raw)
        .with_context(|| format!("cannot parse {}", args.credentials.display()))?;

    tracing::info!(path = %args.commands.display(), "importing commands file");
    let commands_raw = std::fs::read_to_string(&args.commands)
        .with_context(|| format!("cannot read {}", args.commands.display()))?;
    let commands = serde_yaml::from_str(first_document(&commands_raw))
        .with_context(|| format!("cannot parse {}", args.commands.display()))?;

    let host_manager = Arc::new(HostManager::new(credentials, commands));
    let registry = Arc::new(ParserRegistry::load(&[&args.parserdir]));
    let output = Arc::new(
        Output::new(output_kind(args.output_type), args.output_addr.clone())
            .context("cannot configure output")?,
    );

    let collector = Arc::new(Collector::new(
        Arc::clone(&host_manager),
        Arc::clone(&registry),
        Arc::clone(&output),
        CollectorOptions {
            session: SessionOptions {
                timeout: Duration::from_secs(args.timeout),
                retry: args.retry,
                use_hostname: args.usehostname,
                collect_facts: true,
            },
        },
    ));

    let source = InventorySource::new(&args.hosts);

    if args.use_scheduler {
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&host_manager),
            collector,
            Arc::clone(&output),
            SchedulerOptions {
                max_worker_threads: args.max_worker_threads,
                use_threads: !args.no_collector_threads,
                num_threads_per_worker: args.nbr_collector_threads,
            },
        ));

        scheduler.add_hosts(load_inventory(&source, shard), &host_tags, &cmd_tags, false);
        spawn_refresher(
            Arc::clone(&scheduler),
            source,
            shard,
            host_tags,
            cmd_tags,
            Duration::from_secs(args.hosts_refresh_interval),
        );
        // Blocks for the lifetime of the agent.
        scheduler.start();
        return Ok(());
    }

    // One-shot mode: a single pass over the selected hosts.
    host_manager.update_hosts(load_inventory(&source, shard));
    let targets = host_manager.get_target_hosts(&host_tags);

    let use_threads = !args.no_collector_threads;
    if use_threads && !targets.is_empty() {
        let chunk_size = targets.len() / args.nbr_collector_threads + 1;
        std::thread::scope(|scope| {
            for (index, slice) in targets.chunks(chunk_size).enumerate() {
                tracing::info!(slice = index + 1, hosts = ?slice, "collector thread scheduled");
                let collector = Arc::clone(&collector);
                let cmd_tags = cmd_tags.clone();
                let hosts = slice.to_vec();
                scope.spawn(move || {
                    collector.collect("global", CollectRequest::Hosts { hosts, cmd_tags });
                });
            }
        });
    } else {
        collector.collect(
            "global",
            CollectRequest::Hosts {
                hosts: targets.clone(),
                cmd_tags: cmd_tags.clone(),
            },
        );
    }

    let mut stats = Point::new();
    stats.measurement = Some(format!("{}_stats_agent", MEASUREMENT_PREFIX));
    if let Some(sharding) = &args.sharding {
        stats.insert_tag("sharding", sharding);
    }
    stats.insert_field(
        "execution_time_sec",
        format!("{:.4}", time_start.elapsed().as_secs_f64()),
    );
    stats.insert_field("nbr_devices", targets.len() as i64);
    if use_threads {
        stats.insert_field("nbr_threads", args.nbr_collector_threads as i64);
    }
    stats.timestamp_ns = now_ns();
    if let Err(error) = output.emit(vec![stats]) {
        tracing::warn!(%error, "failed to emit agent stats");
    }
    Ok(())
}

fn or_match_all(tags: &[String]) -> Vec<String> {
    if tags.is_empty() {
        vec![".*".to_string()]
    } else {
        tags.to_vec()
    }
}

fn output_kind(output_type: OutputType) -> OutputKind {
    match output_type {
        OutputType::Stdout => OutputKind::Stdout,
        OutputType::Http => OutputKind::Http,
    }
}

fn load_inventory(source: &InventorySource, shard: Option<ShardSpec>) -> Inventory {
    let mut inventory = source.load();
    if let Some(shard) = shard {
        shard_host_list(shard, &mut inventory);
    }
    inventory
}

/// Re-imports the inventory forever, handing each load to the scheduler.
/// New intervals spawn new workers; removed hosts stop being collected
/// within one tick of their worker.
fn spawn_refresher(
    scheduler: Arc<Scheduler>,
    source: InventorySource,
    shard: Option<ShardSpec>,
    host_tags: Vec<String>,
    cmd_tags: Vec<String>,
    interval: Duration,
) {
    let spawned = std::thread::Builder::new()
        .name("inventory-refresh".to_string())
        .spawn(move || loop {
            std::thread::sleep(interval);
            tracing::info!("refreshing inventory");
            let inventory = load_inventory(&source, shard);
            scheduler.add_hosts(inventory, &host_tags, &cmd_tags, true);
        });
    if let Err(error) = spawned {
        tracing::error!(%error, "failed to spawn inventory refresher");
    }
}

/// The commands file is multi-document YAML; only the first document is the
/// command map.
fn first_document(raw: &str) -> &str {
    let body = raw.strip_prefix("---").unwrap_or(raw);
    match body.find("\n---") {
        Some(end) => &body[..end],
        None => body,
    }
}
