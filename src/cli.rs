//! CLI interface

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "babelroom")]
#[command(about = "Real-time multi-party speech translation server", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "BABELROOM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default when no command is given)
    Serve {
        /// Override the listen host
        #[arg(long)]
        host: Option<String>,
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Load all models at startup instead of on first use
        #[arg(long)]
        preload: bool,
        /// Use deterministic in-process models instead of remote inference
        #[arg(long)]
        dev: bool,
    },
    /// Print the effective configuration and exit
    Config,
    /// Mint a room token for a user id (operational tooling)
    Token {
        /// User id the token authenticates
        user_id: uuid::Uuid,
        /// Token lifetime in minutes
        #[arg(long, default_value = "60")]
        ttl_minutes: i64,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
        preload: false,
        dev: false,
    }) {
        Commands::Serve {
            host,
            port,
            preload,
            dev,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if preload {
                config.inference.preload = true;
            }
            if dev {
                let ports = crate::server::Ports::dev(&config);
                crate::server::start_with_ports(config, ports).await
            } else {
                crate::server::start(config).await
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Token {
            user_id,
            ttl_minutes,
        } => {
            let secret = config
                .auth
                .jwt_secret
                .clone()
                .unwrap_or_else(crate::server::auth::generate_secret);
            let auth = crate::server::auth::JwtAuth::new(&secret, config.auth.leeway_secs);
            let token = auth
                .issue(user_id, chrono::Duration::minutes(ttl_minutes))
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{token}");
            if config.auth.jwt_secret.is_none() {
                eprintln!("warning: no jwt_secret configured; this token only matches a server started with the same ephemeral secret");
            }
            Ok(())
        }
    }
}
