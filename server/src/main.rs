use clap::Parser;
use log::{error, info, warn};
use rand::Rng;
use relay_server::config::ServerConfig;
use relay_server::listener::Acceptor;
use relay_server::rcon::RconServer;
use relay_server::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Command line arguments. Anything given here overrides the config file.
#[derive(Parser, Debug)]
#[clap(author, version, about = "Lockstep relay server for multiplayer games")]
struct Args {
    /// JSON configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Address to bind the game port to
    #[clap(short = 'H', long)]
    host: Option<String>,
    /// Game client port
    #[clap(short, long)]
    port: Option<u16>,
    /// Milliseconds between two coordinator iterations
    #[clap(short = 't', long)]
    clock_speed: Option<u64>,
    /// Seed sent to every client in its welcome message
    #[clap(short, long)]
    seed: Option<u32>,
    /// Enable the remote console on this port
    #[clap(long)]
    rcon_port: Option<u16>,
    /// Password for the remote console
    #[clap(long)]
    rcon_password: Option<String>,
    /// Record harvested frames into this directory
    #[clap(long)]
    session_path: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(clock_speed) = self.clock_speed {
            config.clock_speed_ms = clock_speed;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(port) = self.rcon_port {
            config.rcon_enable = true;
            config.rcon_port = port;
        }
        if let Some(password) = self.rcon_password {
            config.rcon_password = password;
        }
        if let Some(path) = self.session_path {
            config.session_logging = true;
            config.session_path = path;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }
    if let Some(dir) = config.session_dir() {
        std::fs::create_dir_all(&dir)?;
    }

    let seed = config
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(0..100_000));
    let game_addr = format!("{}:{}", config.host, config.port);
    let rcon_addr = config
        .rcon_enable
        .then(|| format!("{}:{}", config.host, config.rcon_port));

    let acceptor = match Acceptor::bind(&game_addr) {
        Ok(acceptor) => acceptor,
        Err(e) => {
            error!("Failed to bind {}: {}", game_addr, e);
            std::process::exit(1);
        }
    };

    let registry = Registry::new(config, seed)?;
    info!("Relay started with seed {}", seed);
    let acceptor = acceptor.spawn(Arc::clone(&registry))?;

    if let Some(addr) = rcon_addr {
        match RconServer::bind(&addr, Arc::clone(&registry)).await {
            Ok(rcon) => {
                tokio::spawn(rcon.run());
            }
            Err(e) => {
                error!("Failed to bind rcon on {}: {}", addr, e);
                std::process::exit(1);
            }
        }
    }

    let console = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { run_console(registry).await })
    };

    tokio::select! {
        result = console => {
            if let Err(e) = result {
                warn!("Console task panicked: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    acceptor.stop();
    tokio::task::spawn_blocking(move || registry.shutdown()).await?;
    Ok(())
}

/// Reads operator commands from stdin until `quit` or end of input.
async fn run_console(registry: Arc<Registry>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                // Detached from a terminal; keep serving until Ctrl+C.
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                warn!("Console read failed: {}", e);
                return;
            }
        };

        let command = line.trim().to_string();
        if command.eq_ignore_ascii_case("quit") || command.eq_ignore_ascii_case("exit") {
            return;
        }
        if command.is_empty() {
            continue;
        }

        let registry = Arc::clone(&registry);
        match tokio::task::spawn_blocking(move || registry.execute(&command)).await {
            Ok(Ok(status)) => println!("{}", status),
            Ok(Err(e)) => println!("error: {}", e),
            Err(e) => warn!("Console command panicked: {}", e),
        }
    }
}
