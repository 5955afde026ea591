//! Command-line entry point for the netfuse client: connects to a
//! netfuse server over ZeroMQ and mounts it at a local directory via
//! FUSE.
//!
//! Argument handling follows the teacher's `demos/xmp.rs` style (plain
//! positional args via `std::env`) generalized with `clap` the way
//! `original_source/src/client/main.c`'s getopt-based option table does
//! it, since the protocol now needs several more knobs (endpoint,
//! timeouts, cache tuning, CURVE keys) than a bare mountpoint argument.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use fuser::MountOption;
use netfuse_client::{AttrCache, Engine, InterruptFlags, NetfuseClient, SocketPool, SocketPoolConfig};

/// Mount a remote directory served by a netfuse server over FUSE.
#[derive(Parser, Debug)]
#[command(name = "netfuse-client", version)]
struct Cli {
    /// ZeroMQ endpoint of the netfuse server, e.g. tcp://127.0.0.1:5555
    endpoint: String,

    /// Local directory to mount the remote filesystem at
    mountpoint: String,

    /// Mount read-only
    #[arg(short = 'r', long)]
    read_only: bool,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Per-request timeout, in milliseconds
    #[arg(long, default_value_t = 4000)]
    timeout_ms: u64,

    /// Maximum number of cached attribute entries
    #[arg(long, default_value_t = 4096)]
    cache_entries: usize,

    /// Maximum age, in seconds, of a cached attribute entry
    #[arg(long, default_value_t = 2)]
    cache_age_sec: u64,

    /// Number of entries dropped per cache shrink pass
    #[arg(long, default_value_t = 64)]
    cache_batch: usize,

    /// Server's CURVE public key, z85-encoded (enables encryption)
    #[arg(long)]
    server_key: Option<String>,

    /// Path to this client's CURVE secret key file (z85-encoded, paired
    /// with a `.pub` file of the same name)
    #[arg(long)]
    client_key: Option<String>,
}

fn load_curve_keys(cli: &Cli) -> Result<(Option<[u8; 32]>, Option<([u8; 32], [u8; 32])>), String> {
    let server_public_key = match &cli.server_key {
        Some(z85) => Some(decode_z85_key(z85)?),
        None => None,
    };
    let client_keypair = match &cli.client_key {
        Some(secret_path) => {
            let secret = std::fs::read_to_string(secret_path)
                .map_err(|e| format!("reading client secret key {secret_path}: {e}"))?;
            let public_path = format!("{secret_path}.pub");
            let public = std::fs::read_to_string(&public_path)
                .map_err(|e| format!("reading client public key {public_path}: {e}"))?;
            Some((decode_z85_key(public.trim())?, decode_z85_key(secret.trim())?))
        }
        None => None,
    };
    Ok((server_public_key, client_keypair))
}

fn decode_z85_key(z85: &str) -> Result<[u8; 32], String> {
    let bytes = zmq::z85_decode(z85).map_err(|e| format!("invalid z85 key: {e}"))?;
    bytes.try_into().map_err(|_| "decoded key is not 32 bytes".to_string())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let (server_public_key, client_keypair) = match load_curve_keys(&cli) {
        Ok(keys) => keys,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let context = zmq::Context::new();
    let timeout = Duration::from_millis(cli.timeout_ms);

    if !Engine::ping_reachable(&context, &cli.endpoint, timeout) {
        log::error!("server at {} did not respond to PING within {:?}", cli.endpoint, timeout);
        return ExitCode::FAILURE;
    }

    let pool_config = SocketPoolConfig { endpoint: cli.endpoint.clone(), server_public_key, client_keypair };
    let pool = SocketPool::new(context, pool_config);
    let interrupts = InterruptFlags::default();
    let engine = Engine::new(pool, timeout, interrupts);
    let cache = AttrCache::new(cli.cache_entries, cli.cache_age_sec, cli.cache_batch);
    let filesystem = NetfuseClient::new(engine, cache);

    let mut options = vec![MountOption::FSName("netfuse".to_string())];
    options.push(if cli.read_only { MountOption::RO } else { MountOption::RW });
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }

    match fuser::mount2(filesystem, &cli.mountpoint, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}
