use anyhow::Context;
use clap::{Parser, Subcommand};
use regdesk::app;
use regdesk::config::ConsoleConfig;
use regdesk::login::AdminDirectory;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "regdesk", about = "Event registration admin console")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP console
    Serve {
        /// JSON settings file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create or reset an admin account
    AddAdmin {
        #[arg(long)]
        config: Option<PathBuf>,

        username: String,
        password: String,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ConsoleConfig> {
    match path {
        Some(p) => ConsoleConfig::load(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(ConsoleConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve { config, port } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.port = port;
            }
            if let Ok(ip) = local_ip_address::local_ip() {
                log::info!("Console reachable on the LAN at http://{}:{}", ip, config.port);
            }
            app::run(config).await?;
        }
        Command::AddAdmin {
            config,
            username,
            password,
        } => {
            let config = load_config(config.as_deref())?;
            let directory = AdminDirectory::new(config.admins_file(), &config.admin_email_domain);
            let email = directory.add_admin(&username, &password)?;
            println!("Admin {} saved to {}", email, config.admins_file().display());
        }
    }
    Ok(())
}
