//! awg-bridge: AmneziaWG userspace tunnel with a SOCKS5 UDP relay
//!
//! ```bash
//! # Run with a configuration file
//! awg-bridge -c /etc/awg-bridge.conf
//!
//! # Validate the configuration and exit
//! awg-bridge -c /etc/awg-bridge.conf --check
//!
//! # Override the log level
//! RUST_LOG=debug awg-bridge -c awg.conf
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use awg_bridge::config::load_config;
use awg_bridge::device::AwgDevice;
use awg_bridge::relay::{UdpRelay, UdpRelayConfig};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Local SOCKS5 UDP bind address
    bind_addr: SocketAddr,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/awg-bridge.conf");
        let mut bind_addr: SocketAddr = "127.0.0.1:1080".parse().expect("valid literal");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-b" | "--bind" => {
                    if let Some(addr) = args.next() {
                        match addr.parse() {
                            Ok(parsed) => bind_addr = parsed,
                            Err(_) => {
                                eprintln!("Invalid bind address: {addr}");
                                std::process::exit(1);
                            }
                        }
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("awg-bridge v{}", awg_bridge::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            bind_addr,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"awg-bridge v{}

Userspace AmneziaWG tunnel exposed as a SOCKS5 UDP relay.

USAGE:
    awg-bridge [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Configuration file path [default: /etc/awg-bridge.conf]
    -b, --bind <ADDR>     SOCKS5 UDP bind address [default: 127.0.0.1:1080]
    --check               Validate the configuration and exit
    -h, --help            Print help information
    -v, --version         Print version information

ENVIRONMENT:
    RUST_LOG              Log filter (trace, debug, info, warn, error)

CONFIGURATION:
    wg-quick style [Interface]/[Peer] file. The [Interface] section also
    accepts the AmneziaWG keys Jc, Jmin, Jmax, S1-S4, H1-H4 and I1-I5.
"#,
        awg_bridge::VERSION
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    // Configuration failures are fatal and must surface the first violated
    // invariant verbatim.
    let config = match load_config(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if args.check_config {
        println!("Configuration is valid");
        return ExitCode::SUCCESS;
    }

    match run(config, args.bind_addr).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: awg_bridge::DeviceConfig, bind_addr: SocketAddr) -> Result<()> {
    info!("awg-bridge v{}", awg_bridge::VERSION);

    let device = AwgDevice::start(&config).await?;
    info!(peers = device.peer_count(), "tunnel device started");

    let relay_config = UdpRelayConfig {
        listen_addr: bind_addr,
        ..UdpRelayConfig::default()
    };
    let relay = UdpRelay::bind(relay_config, device.clone()).await?;
    info!(addr = %relay.local_addr(), "SOCKS5 UDP relay bound");

    let result = tokio::select! {
        result = relay.run() => result.map_err(Into::into),
        _ = signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
            Ok(())
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
            Ok(())
        }
    };

    relay.shutdown();
    device.down();

    let stats = relay.stats_snapshot();
    info!(
        received = stats.datagrams_received,
        relayed = stats.datagrams_relayed,
        replies = stats.replies_sent,
        "final relay stats"
    );

    result
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
