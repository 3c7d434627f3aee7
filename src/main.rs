//! proxy-relay: dual-protocol forward proxy relay
//!
//! This is the main entry point for the relay binary.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./proxy-relay
//!
//! # Run with custom configuration
//! ./proxy-relay -c /path/to/config.json
//!
//! # Run with environment overrides
//! PROXY_RELAY_PROTOCOL=socks5 PROXY_RELAY_PORT=1080 ./proxy-relay
//! ```

use std::path::PathBuf;

use anyhow::Result;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use proxy_relay::config::{self, Config};
use proxy_relay::server::ProxyServer;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/proxy-relay/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("proxy-relay v{}", proxy_relay::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"proxy-relay v{}

Dual-protocol (SOCKS5/HTTP) forward proxy relay with bypass policy and
live traffic statistics.

USAGE:
    proxy-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/proxy-relay/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    PROXY_RELAY_PORT         Override the requested listen port
    PROXY_RELAY_PROTOCOL     Override the protocol kind (socks5/http)
    PROXY_RELAY_LOG_LEVEL    Override log level (trace, debug, info, warn, error)
    PROXY_BYPASS_HOSTS       Comma-separated extra bypass entries
    KUBERNETES_SERVICE_HOST  Presence enables cluster mode (dynamic port search)

EXAMPLE:
    # SOCKS5 proxy on port 1080
    PROXY_RELAY_PROTOCOL=socks5 PROXY_RELAY_PORT=1080 proxy-relay -c config.json
"#,
        proxy_relay::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        config::create_default_config(&args.config_path)?;
        println!("Default configuration written to {:?}", args.config_path);
        return Ok(());
    }

    let config = if args.config_path.exists() {
        config::load_config_with_env(&args.config_path)?
    } else {
        let mut config = Config::default_config();
        config::apply_env(&mut config)?;
        config
    };

    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    init_logging(&config);

    if !args.config_path.exists() {
        info!(
            "No configuration file at {:?}, using defaults with environment overrides",
            args.config_path
        );
    }

    let server = ProxyServer::new(config);
    let actual_port = server.start().await?;
    info!(
        "proxy-relay v{} ready, {} proxy on port {}",
        proxy_relay::VERSION,
        server.protocol(),
        actual_port
    );

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    server.stop().await;

    let stats = server.stats();
    info!(
        total_connections = stats.total_connections,
        total_bytes = stats.total_bytes,
        "Final traffic snapshot"
    );

    Ok(())
}
