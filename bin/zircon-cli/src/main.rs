//! Zircon CLI - demo client against a running fleet.
//!
//! Drives the client library end to end: mint a chunk, write at a version,
//! read a range, inspect the replica set, delete.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zircon_client::Client;
use zircon_common::{ChunkId, Config, Version};

#[derive(Parser, Debug)]
#[command(name = "zircon")]
#[command(about = "Zircon demo client")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/zircon/zircon.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Allocate a new chunk and print its id
    New,
    /// Read a byte range from a chunk
    Read {
        /// Chunk id (16 hex digits)
        id: String,
        #[arg(default_value_t = 0)]
        offset: u32,
        #[arg(default_value_t = 64)]
        length: u32,
    },
    /// Write bytes at an offset, against an expected version
    Write {
        /// Chunk id (16 hex digits)
        id: String,
        offset: u32,
        /// Expected version; "any" skips the check
        version: String,
        /// Bytes to write, as a UTF-8 string
        data: String,
    },
    /// Delete a chunk at an expected version
    Delete {
        /// Chunk id (16 hex digits)
        id: String,
        /// Expected version; "any" skips the check
        version: String,
    },
    /// Show a chunk's version and replica set
    Info {
        /// Chunk id (16 hex digits)
        id: String,
    },
}

fn parse_chunk(raw: &str) -> Result<ChunkId> {
    ChunkId::from_hex(raw).with_context(|| format!("invalid chunk id {raw:?} (want 16 hex digits)"))
}

fn parse_version(raw: &str) -> Result<Version> {
    if raw.eq_ignore_ascii_case("any") {
        return Ok(Version::ANY);
    }
    let value: u64 = raw
        .parse()
        .with_context(|| format!("invalid version {raw:?}"))?;
    Ok(Version::from_raw(value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config)?;
    let client = Client::connect(config.client_config)?;

    let result = run(&client, args.command).await;
    client.close().await;
    result
}

async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::New => {
            let id = client.new_chunk().await?;
            println!("{id}");
        }
        Command::Read { id, offset, length } => {
            let id = parse_chunk(&id)?;
            let (data, version) = client.read(id, offset, length).await?;
            println!("version {version}");
            match std::str::from_utf8(&data) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{data:?}"),
            }
        }
        Command::Write {
            id,
            offset,
            version,
            data,
        } => {
            let id = parse_chunk(&id)?;
            let version = parse_version(&version)?;
            let new_version = client.write(id, offset, version, data.as_bytes()).await?;
            println!("version {new_version}");
        }
        Command::Delete { id, version } => {
            let id = parse_chunk(&id)?;
            let version = parse_version(&version)?;
            client.delete(id, version).await?;
            println!("deleted");
        }
        Command::Info { id } => {
            let id = parse_chunk(&id)?;
            let stat = client.stat(id).await?;
            println!("chunk   {id}");
            println!("version {}", stat.version);
            if stat.locations.is_empty() {
                bail!("chunk has no replicas");
            }
            for (name, address) in stat.locations {
                let address = if address.is_empty() {
                    "<unregistered>"
                } else {
                    address.as_str()
                };
                println!("replica {name} @ {address}");
            }
        }
    }
    Ok(())
}
