//! geocache: fetch through the nearest cache replica from the command line.

use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use geocache::{CacheClient, CacheValue, Config, Endpoint, OriginRequest};

/// geocache command line
#[derive(Parser, Debug)]
#[command(name = "geocache")]
#[command(about = "Geography-aware read-through cache client")]
struct Args {
    /// Sentinel address (host:port); repeat for several
    #[arg(short, long = "sentinel", required = true)]
    sentinels: Vec<String>,

    /// Name of the monitored primary group
    #[arg(short = 'n', long, default_value = "mymaster")]
    primary_name: String,

    /// Store password (shared by primary and replicas)
    #[arg(long, env = "GEOCACHE_PASSWORD")]
    password: Option<String>,

    /// Sentinel socket timeout (seconds)
    #[arg(long, default_value = "1.0")]
    sentinel_timeout: f64,

    /// Store socket timeout (seconds)
    #[arg(long)]
    store_timeout: Option<f64>,

    /// ipinfo access token
    #[arg(long, env = "GEOCACHE_IPINFO_TOKEN")]
    ipinfo_token: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a URL through the cache and write the body to stdout
    Fetch {
        url: String,
        /// Cache expiration (seconds)
        #[arg(short, long)]
        expire: Option<u64>,
        /// Extra request header (`Name: value`); repeat for several
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        /// HTTP method (default GET, or POST with --data)
        #[arg(short = 'X', long)]
        method: Option<String>,
        /// Request body
        #[arg(short, long)]
        data: Option<String>,
    },
    /// Print the discovered topology
    Topology,
    /// Read a key from the nearest replica
    Get { key: String },
    /// Delete a key through the primary
    Delete { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&args)?;
    let client = CacheClient::connect(&config).await?;

    match args.command {
        Command::Fetch {
            url,
            expire,
            headers,
            method,
            data,
        } => {
            let mut request = OriginRequest {
                method,
                data: data.map(String::into_bytes),
                ..OriginRequest::get(url)
            };
            for header in &headers {
                let (name, value) = header
                    .split_once(':')
                    .with_context(|| format!("header {header:?} is not `Name: value`"))?;
                request = request.with_header(name.trim(), value.trim());
            }
            let body = client.fetch_with_cache(&request, expire).await?;
            std::io::stdout().write_all(&body)?;
        }
        Command::Topology => {
            let topology = client.topology();
            match topology.primary() {
                Some(primary) => println!("primary  {primary}"),
                None => println!("primary  (none)"),
            }
            for replica in topology.replicas() {
                let distance = replica
                    .distance_km
                    .map(|km| format!("{km:.1} km"))
                    .unwrap_or_else(|| "unknown".to_string());
                let marker = if topology.nearest() == Some(replica) {
                    "*"
                } else {
                    " "
                };
                println!("replica{marker} {}  {distance}", replica.endpoint);
            }
        }
        Command::Get { key } => match client.read(&key).await {
            Some(value) => print_value(value)?,
            None => info!(key = %key, "Not cached"),
        },
        Command::Delete { key } => {
            if !client.delete(&key).await {
                anyhow::bail!("delete of {key:?} failed");
            }
        }
    }

    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
    let sentinels = args
        .sentinels
        .iter()
        .map(|s| s.parse::<Endpoint>())
        .collect::<Result<Vec<_>, _>>()?;

    let config = Config {
        sentinels,
        primary_name: args.primary_name.clone(),
        password: args.password.clone(),
        sentinel_socket_timeout: seconds(args.sentinel_timeout)?,
        store_socket_timeout: args.store_timeout.map(seconds).transpose()?,
        geo_token: args.ipinfo_token.clone(),
    };
    config.validate()?;
    Ok(config)
}

fn seconds(value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid timeout {value}"))
}

fn print_value(value: CacheValue) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    match value {
        CacheValue::Bytes(bytes) | CacheValue::ByteArray(bytes) => stdout.write_all(&bytes)?,
        CacheValue::None => writeln!(stdout, "null")?,
        CacheValue::Tuple(items) => writeln!(stdout, "{}", serde_json::Value::Array(items))?,
        CacheValue::Plain(plain) => match plain.into_value() {
            serde_json::Value::String(s) => writeln!(stdout, "{s}")?,
            other => writeln!(stdout, "{other}")?,
        },
    }
    Ok(())
}
