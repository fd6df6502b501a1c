use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use heart::{
    setup_local_tracing, setup_tracing, AppError, AppResult, NodeConfig, NodeEngine, NodeEvent,
};
use tokio::runtime;
use tracing::{info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// write rolling logs here and export traces and metrics over OTLP
    #[arg(long)]
    pub log_dir: Option<String>,
    /// peers to dial after start-up, as host:port
    #[arg(long = "connect")]
    pub peers: Vec<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn split_peer(peer: &str) -> Option<(&str, u16)> {
    let (host, port) = peer.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline = CommandLine::parse();
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let config = NodeConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let _otel_guard = match &commandline.log_dir {
        Some(log_dir) => Some(rt.block_on(async { setup_tracing(log_dir) })?),
        None => {
            setup_local_tracing()?;
            None
        }
    };

    rt.block_on(async {
        let node = NodeEngine::new(config)?;
        let bind_address = node.config().bind_address.clone();
        let port = node.config().port;
        let tls_mode = node.config().tls_mode;
        let local_address = node.run(&bind_address, port).await?;
        info!("heart node up on {}", local_address);

        let mut events = node.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    NodeEvent::AddNodeFailed { target, error } => {
                        warn!("could not add {}: {}", target, error)
                    }
                    event => info!("{:?}", event),
                }
            }
        });

        for peer in &commandline.peers {
            match split_peer(peer) {
                Some((host, port)) => {
                    node.connect_to_host(host, port, tls_mode);
                }
                None => warn!("ignoring peer {}, expected host:port", peer),
            }
        }

        tokio::signal::ctrl_c().await?;
        info!("ctrl-c received, shutting down");
        node.stop().await;
        Ok::<(), AppError>(())
    })
}
