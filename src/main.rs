//! Logship - Time-Bucketed Log Shipping
//!
//! Runs the collector, ships lines from stdin, and inspects bucket layout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use logship::bucket::TimeBucketer;
use logship::clock::SystemClock;
use logship::codec::{RowEncoder, Schema, TypeTag, Value};
use logship::config::{LoggingConfig, LogshipConfig};
use logship::disk::DiskBackend;
use logship::network::{
    read_message, write_message, CollectorServer, Component, ControlState, Message,
    ReplicatorClient,
};
use logship::Logger;

/// Logship - Time-Bucketed Log Shipping
#[derive(Parser)]
#[command(name = "logship")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "logship.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector server
    Serve,

    /// Log lines from stdin as rows with a single STRING column
    Send {
        /// File prefix (top-level directory under the base dir)
        #[arg(short, long)]
        prefix: String,

        /// Log type
        #[arg(short = 't', long, default_value = "line")]
        log_type: String,

        /// Tag as key=value, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Ask a collector for its availability
    Status {
        /// Collector address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:7411")]
        address: String,
    },

    /// Print bucket timestamps around an instant
    Buckets {
        /// Buckets per hour
        #[arg(short, long, default_value_t = 12)]
        buckets_per_hour: u32,

        /// RFC 3339 instant (defaults to now)
        #[arg(long)]
        at: Option<String>,

        /// Number of timestamps to print
        #[arg(short = 'n', long, default_value_t = 6)]
        count: usize,

        /// Walk backwards instead of forwards
        #[arg(long)]
        before: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "logship.toml")]
        output: PathBuf,

        /// Host name of this node
        #[arg(long, default_value = "localhost")]
        hostname: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when there is one
    let logging = LogshipConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Serve => run_serve(cli.config).await,
        Commands::Send {
            prefix,
            log_type,
            tags,
        } => run_send(cli.config, prefix, log_type, tags).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Buckets {
            buckets_per_hour,
            at,
            count,
            before,
        } => run_buckets(buckets_per_hour, at, count, before),
        Commands::Init { output, hostname } => run_init(output, hostname),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<LogshipConfig> {
    LogshipConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {:?}", path))
}

/// Run the collector until interrupted
async fn run_serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    tracing::info!("Starting collector on {}", config.node.hostname);

    std::fs::create_dir_all(&config.node.data_dir).with_context(|| {
        format!("Failed to create data directory {:?}", config.node.data_dir)
    })?;

    let disk = DiskBackend::new(&config.disk, config.bucketer()?, &config.node.hostname)
        .context("Failed to initialize disk backend")?;
    let control = ControlState::load(config.control_state_path(), config.server.max_sessions)
        .with_context(|| format!("Failed to load control state {:?}", config.control_state_path()))?;

    let server = Arc::new(CollectorServer::new(
        config.server.bind_address.clone(),
        config.node.hostname.clone(),
        Arc::new(disk),
        control,
        Arc::new(SystemClock),
    ));
    let components: Vec<Arc<dyn Component>> = vec![server.clone()];

    let mut serve_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    tokio::select! {
        result = &mut serve_task => {
            result.context("Collector task panicked")??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    for component in &components {
        if let Err(e) = component.stop().await {
            tracing::error!("Failed to stop {}: {}", component.name(), e);
        }
    }
    serve_task.await.context("Collector task panicked")??;

    Ok(())
}

fn parse_tags(tags: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    tags.iter()
        .map(|tag| match tag.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => bail!("Tag '{}' is not key=value", tag),
        })
        .collect()
}

/// Log stdin lines through the configured backends
async fn run_send(
    config_path: PathBuf,
    prefix: String,
    log_type: String,
    tags: Vec<String>,
) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let tags = parse_tags(&tags)?;
    let hostname = config.node.hostname.clone();

    let mut logger =
        Logger::new(hostname.clone(), Arc::new(SystemClock)).with_policy(config.disk.on_unavailable);

    let mut disk = None;
    if config.disk.enabled {
        let backend = Arc::new(
            DiskBackend::new(&config.disk, config.bucketer()?, &hostname)
                .context("Failed to initialize disk backend")?,
        );
        logger = logger.with_backend(backend.clone());
        disk = Some(backend);
    }

    let mut client = None;
    if config.client.enabled {
        let backend = Arc::new(ReplicatorClient::spawn(&config.client, hostname.clone()));
        logger = logger.with_backend(backend.clone());
        client = Some(backend);
    }

    if logger.backends().is_empty() {
        bail!("Neither [disk] nor [client] is enabled in {:?}", config_path);
    }

    let schema = Schema::new(vec!["line".to_string()], vec![TypeTag::String.into()])?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let mut encoder = RowEncoder::new(&schema);
        encoder.push_row(&[Value::String(line)])?;
        logger.log(
            &prefix,
            &tags,
            &log_type,
            schema.headers(),
            schema.column_types(),
            &encoder.finish(),
        );
        count += 1;
    }

    if let Some(client) = client {
        let report = client.stop().await?;
        println!(
            "Shipped: {} acknowledged, {} rejected, {} unsent",
            report.acknowledged, report.rejected, report.retained
        );
        if let Some(error) = report.error {
            eprintln!("Last shipping error: {}", error);
        }
    }
    if let Some(disk) = disk {
        disk.close_all()?;
    }

    println!("Logged {} rows ({} dropped)", count, logger.dropped_rows());
    Ok(())
}

/// Query a collector's availability
async fn run_status(address: String) -> anyhow::Result<()> {
    let exchange = async {
        let mut stream = TcpStream::connect(&address).await?;
        write_message(&mut stream, &Message::StatusRequest).await?;
        read_message(&mut stream).await
    };

    let reply = tokio::time::timeout(Duration::from_secs(5), exchange)
        .await
        .with_context(|| format!("Timed out waiting for {}", address))?
        .with_context(|| format!("Status request to {} failed", address))?;

    match reply {
        Message::StatusResponse {
            server_hostname,
            availability,
        } => {
            println!("Collector:        {}", server_hostname);
            println!("Available:        {}", availability.available);
            println!("Free bytes:       {}", availability.free_bytes);
            println!("Required bytes:   {}", availability.required_bytes);
            Ok(())
        }
        other => bail!("Unexpected reply {}", other.type_name()),
    }
}

/// Print bucket timestamps and their directories
fn run_buckets(
    buckets_per_hour: u32,
    at: Option<String>,
    count: usize,
    before: bool,
) -> anyhow::Result<()> {
    let bucketer = TimeBucketer::new(buckets_per_hour)?;
    let at = match at {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .with_context(|| format!("Invalid instant '{}'", s))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    println!(
        "{} is in bucket {} ({})",
        at.to_rfc3339(),
        bucketer.current_bucket(at),
        bucketer.format(at)
    );

    let sequence = if before {
        bucketer.timestamps_before(at, count)
    } else {
        bucketer.timestamps_after(at, count)
    };
    for timestamp in &sequence {
        println!("  {}  {}", timestamp, bucketer.directory_name(&timestamp)?);
    }

    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, hostname: String) -> anyhow::Result<()> {
    let config_content = format!(
        r#"# Logship Configuration
# Generated configuration file

[node]
hostname = "{hostname}"
data_dir = "/var/lib/logship"

[bucket]
# Must divide 60
buckets_per_hour = 12

[disk]
enabled = true
base_dir = "/var/log/logship"
# Variables: LOG_TYPE LOG_VERSION SERVER_HOST CLIENT_HOST YEAR MONTH DAY
# HOUR MINUTE INTERVAL LOG_TIME_INTERVAL REGION, plus any tag key
filename_pattern = "{{LOG_TYPE}}-{{LOG_VERSION}}-{{CLIENT_HOST}}"
compression = "gzip"        # none | gzip | lz4
required_free_space_bytes = 1073741824
log_version = 1
region_env = "REGION"
on_unavailable = "write"    # write | drop

[client]
enabled = false
collector_address = "127.0.0.1:7411"
buffer_capacity_bytes = 67108864
flush_interval_ms = 1000
connect_timeout_ms = 5000
request_timeout_ms = 30000

[server]
bind_address = "0.0.0.0:7411"
# control_state_path = "/var/lib/logship/control.json"
max_sessions = 4096

[logging]
level = "info"
format = "pretty"           # pretty | json
"#
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("Failed to write {:?}", output))?;
    println!("Configuration file created: {}", output.display());
    println!("Then start a collector with: logship --config {} serve", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match LogshipConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Hostname:        {}", config.node.hostname);
            println!("  Buckets/hour:    {}", config.bucket.buckets_per_hour);
            println!(
                "  Disk:            {} ({:?}, {:?})",
                if config.disk.enabled { "enabled" } else { "disabled" },
                config.disk.base_dir,
                config.disk.compression
            );
            println!(
                "  Client:          {} -> {}",
                if config.client.enabled { "enabled" } else { "disabled" },
                config.client.collector_address
            );
            println!("  Server:          {}", config.server.bind_address);
            println!("  Control state:   {:?}", config.control_state_path());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
