//! # IPbus Bridge
//!
//! Command line front-end for the processes of a soft IPbus deployment.
//!
//! ## Overview
//!
//! A deployment is split into a network-facing process and a serial-facing process, joined by a
//! pair of named pipes:
//!
//! ```text
//! clients ⇄ ipbus-bridge forward ⇄ requests/responses ⇄ ipbus-bridge serial ⇄ link ⇄ hardware
//! ```
//!
//! `serve` and `target` execute transactions directly against a memory backend or a memory-mapped
//! device window, `local` runs every stage in one process.
pub mod backends;
pub mod devices;

use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use clap_num::maybe_hex;
use env_logger::Env;
use ipbus_server::{
    forward::{ForwardConfig, Forwarder},
    local::{LocalConfig, spawn_local_bridge},
    memory::MemoryTarget,
    responder::LinkResponder,
    serial::{AdapterConfig, SerialAdapter},
    server::{Config, Server},
};
use tokio::net::TcpListener;

use crate::backends::{Backend, mmap::MappedTarget, uio_device_path};

#[derive(ClapArgs, Clone, Debug)]
struct BackendArgs {
    /// Device to map, e.g. /dev/mem or /dev/uio0. Without it an emulated memory is served.
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Name of a UIO device to map
    #[arg(short, long, conflicts_with = "device")]
    uio: Option<String>,

    /// Bus address of the first word
    #[arg(long, default_value = "0x0", value_parser = maybe_hex::<u32>)]
    base: u32,

    /// Number of words
    #[arg(long, default_value = "0x10000", value_parser = maybe_hex::<usize>)]
    size: usize,

    /// Offset of the window into the device, in bytes
    #[arg(long, default_value = "0x0", value_parser = maybe_hex::<u64>)]
    offset: u64,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Serve clients directly from a backend
    Serve {
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Serve clients by forwarding their transactions over a pair of named pipes
    Forward {
        requests: PathBuf,
        responses: PathBuf,
        #[arg(short, long, help = "Response timeout in milliseconds", default_value = "5000")]
        timeout_ms: u64,
    },
    /// Carry transactions from a pair of named pipes to a hardware link
    Serial {
        requests: PathBuf,
        responses: PathBuf,
        link: PathBuf,
        #[arg(short, long, default_value = "115200")]
        baud: u32,
        #[arg(short, long, help = "Link timeout in milliseconds", default_value = "1000")]
        timeout_ms: u64,
    },
    /// Execute transactions arriving on a hardware link against a backend
    Target {
        link: PathBuf,
        #[arg(short, long, default_value = "115200")]
        baud: u32,
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Run every stage of the bridge in this process
    Local {
        #[command(flatten)]
        backend: BackendArgs,
    },
}

#[derive(Parser)]
#[command(about = "Soft IPbus bridge for FPGA register access", long_about=None)]
struct Args {
    #[arg(short, long, default_value = "60002")]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    #[command(subcommand)]
    command: Command,
}

fn open_backend(args: BackendArgs) -> Result<Backend, Box<dyn Error>> {
    let device = match (args.device, args.uio) {
        (Some(path), _) => Some(path),
        (None, Some(name)) => match uio_device_path(&name) {
            Some(path) => {
                log::info!("Found UIO device {} at {}", name, path.display());
                Some(path)
            }
            None => return Err(format!("No UIO device named {}", name).into()),
        },
        (None, None) => None,
    };
    Ok(match device {
        Some(path) => Backend::Mapped(MappedTarget::new(
            path,
            args.offset,
            args.base,
            args.size,
        )?),
        None => {
            log::info!(
                "Emulating {} words of memory at {:#010x}",
                args.size,
                args.base
            );
            Backend::Memory(MemoryTarget::new(args.base, args.size))
        }
    })
}

async fn run(addr: SocketAddr, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Serve { backend } => {
            let server = Server::new(open_backend(backend)?, Config::default());
            server.listen(addr).await?;
        }
        Command::Forward {
            requests,
            responses,
            timeout_ms,
        } => {
            let requests = devices::open_sender(&requests).await?;
            let responses = devices::open_receiver(&responses).await?;
            let config = ForwardConfig {
                response_timeout: Duration::from_millis(timeout_ms),
                ..ForwardConfig::default()
            };
            let server = Server::new(
                Forwarder::new(responses, requests, config),
                Config::default(),
            );
            server.listen(addr).await?;
        }
        Command::Serial {
            requests,
            responses,
            link,
            baud,
            timeout_ms,
        } => {
            let requests = devices::open_receiver(&requests).await?;
            let responses = devices::open_sender(&responses).await?;
            let link = devices::open_link(&link, baud)?;
            let config = AdapterConfig {
                link_timeout: Duration::from_millis(timeout_ms),
                ..AdapterConfig::default()
            };
            SerialAdapter::new(requests, responses, link, config)
                .run()
                .await?;
        }
        Command::Target {
            link,
            baud,
            backend,
        } => {
            let target = open_backend(backend)?;
            let link = devices::open_link(&link, baud)?;
            LinkResponder::new(link, target).run().await?;
        }
        Command::Local { backend } => {
            let listener = TcpListener::bind(addr).await?;
            let bridge = spawn_local_bridge(listener, open_backend(backend)?, LocalConfig::default())?;
            bridge.join().await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting IPbus bridge");

    let args = Args::parse();
    log::debug!("Parsed arguments: ip={}, port={}", args.ip, args.port);

    let addr = SocketAddr::new(args.ip, args.port);
    tokio::select! {
        result = run(addr, args.command) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
            Ok(())
        }
    }
}
