use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use intercept_proxy::ProxyServer;
use intercept_proxy::config::ProxyConfig;
use intercept_proxy::tunnel::SpliceTunnelHandler;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "intercept-proxy", version)]
#[command(about = "Intercepting HTTP/1.1 proxy with streaming body filters", long_about = None)]
struct Cli {
    /// JSON configuration file, defaults apply when omitted
    config: Option<PathBuf>,

    /// Address to accept proxy connections on, overrides the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log level, overrides the configuration
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match ProxyConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("intercept-proxy: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("intercept-proxy: setting default subscriber failed: {e}");
    }

    let tunnel = SpliceTunnelHandler::new(&config);
    let server = match ProxyServer::builder().config(config).tunnel(tunnel).build() {
        Ok(server) => server,
        Err(e) => {
            error!(cause = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let handle = match server.start() {
        Ok(handle) => handle,
        Err(e) => {
            error!(cause = %e, "can't start proxy");
            return ExitCode::FAILURE;
        }
    };
    info!(local_addr = %handle.local_addr(), "accepting proxy requests");

    match handle.join() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(cause = %e, "proxy stopped");
            ExitCode::FAILURE
        }
    }
}
