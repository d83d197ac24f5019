//! memcast CLI Client
//!
//! Command-line interface for talking to one or more memcached servers.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use memcast::{Client, Config, Value};
use tracing_subscriber::{fmt, EnvFilter};

/// memcast CLI
#[derive(Parser, Debug)]
#[command(name = "memcast-cli")]
#[command(about = "CLI for memcached servers")]
#[command(version)]
struct Args {
    /// Server address (host:port[:weight]); repeat for a pool
    #[arg(short, long = "server", default_value = "127.0.0.1:11211")]
    servers: Vec<String>,

    /// Per-command timeout in milliseconds
    #[arg(short, long, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get one or more keys
    Get {
        /// The keys to get
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,

        /// How to store the value
        #[arg(long, value_enum, default_value = "string")]
        kind: ValueKind,

        /// Time to live in seconds (0 = never expire)
        #[arg(long, default_value = "0")]
        ttl: u32,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Increment a counter
    Incr { key: String, delta: u64 },

    /// Decrement a counter
    Decr { key: String, delta: u64 },

    /// Invalidate every item on every server
    FlushAll,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ValueKind {
    String,
    Number,
    Json,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,memcast=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> memcast::Result<()> {
    let timeout = Duration::from_millis(args.timeout_ms);
    let config = args
        .servers
        .iter()
        .fold(Config::builder(), |builder, s| builder.server(s))
        .command_timeout(Some(timeout))
        .connect_timeout(timeout)
        .build()?;

    let client = Client::connect(config)?;

    match args.command {
        Commands::Get { keys } if keys.len() == 1 => match client.get(&keys[0]).wait()? {
            Some(value) => println!("{}", render(&value)),
            None => println!("(miss)"),
        },
        Commands::Get { keys } => {
            let result = client.get_multi(&keys).wait()?;
            for key in &keys {
                match (result.get(key), result.error(key)) {
                    (Some(value), _) => println!("{}: {}", key, render(value)),
                    (None, Some(error)) => println!("{}: (error: {})", key, error),
                    (None, None) => println!("{}: (miss)", key),
                }
            }
        }
        Commands::Set {
            key,
            value,
            kind,
            ttl,
        } => {
            let value = parse_value(&value, kind)?;
            let stored = client.set(&key, value, ttl).wait()?;
            println!("{}", if stored { "STORED" } else { "NOT_STORED" });
        }
        Commands::Del { key } => {
            let deleted = client.delete(&key).wait()?;
            println!("{}", if deleted { "DELETED" } else { "NOT_FOUND" });
        }
        Commands::Incr { key, delta } => print_counter(client.incr(&key, delta).wait()?),
        Commands::Decr { key, delta } => print_counter(client.decr(&key, delta).wait()?),
        Commands::FlushAll => {
            for (server, result) in client.flush_all().wait()? {
                match result {
                    Ok(()) => println!("{}: OK", server),
                    Err(e) => println!("{}: {}", server, e),
                }
            }
        }
    }

    client.end();
    Ok(())
}

fn parse_value(raw: &str, kind: ValueKind) -> memcast::Result<Value> {
    match kind {
        ValueKind::String => Ok(Value::from(raw)),
        ValueKind::Number => raw
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .map_err(|e| memcast::Error::Codec(format!("'{}' is not a number: {}", raw, e))),
        ValueKind::Json => Ok(Value::Json(serde_json::from_str(raw)?)),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Json(v) => v.to_string(),
        Value::Binary(b) => format!("<{} bytes>", b.len()),
    }
}

fn print_counter(value: Option<u64>) {
    match value {
        Some(n) => println!("{}", n),
        None => println!("NOT_FOUND"),
    }
}
