use bridge::channels::{MediaMessage, OutboundSender, SidecarClient};
use bridge::config::{self, Account, DEFAULT_ACCOUNT_ID};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "beagle")]
#[command(about = "Beagle sidecar bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: BEAGLE_CONFIG_PATH or ~/.beagle/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Connect every enabled account to its sidecar, dispatch inbound messages to the agent runtime, and serve the gateway.
    Run {
        /// Config file path (default: BEAGLE_CONFIG_PATH or ~/.beagle/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Gateway HTTP port (default from config or 39190)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Send one message to a peer through the sidecar.
    Send {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Account id (default: "default", or the only configured account)
        #[arg(long, short)]
        account: Option<String>,

        #[arg(long)]
        peer: String,

        /// Message text (caption when --media-url is given)
        #[arg(long, default_value = "")]
        text: String,

        #[arg(long, value_name = "URL")]
        media_url: Option<String>,
    },

    /// Probe an account's sidecar (GET /health).
    Health {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, short)]
        account: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("beagle {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, port }) => {
            if let Err(e) = run_bridge(config, port).await {
                log::error!("run failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Send {
            config,
            account,
            peer,
            text,
            media_url,
        }) => {
            if let Err(e) = run_send(config, account, peer, text, media_url).await {
                log::error!("send failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Health { config, account }) => match run_health(config, account).await {
            Ok(true) => println!("ok"),
            Ok(false) => {
                println!("unhealthy");
                std::process::exit(2);
            }
            Err(e) => {
                log::error!("health failed: {:#}", e);
                std::process::exit(1);
            }
        },
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = bridge::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_bridge(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    log::info!(
        "starting bridge, gateway on {}:{}",
        config.gateway.bind,
        port.unwrap_or(config.gateway.port)
    );
    bridge::gateway::run_gateway(config, path, port).await
}

/// Client for `account`, or for `default` / the only configured account.
fn client_for(config_path: Option<PathBuf>, account: Option<String>) -> anyhow::Result<SidecarClient> {
    let (config, _) = config::load_config(config_path)?;
    let settings = config::resolve_settings(&config);
    let accounts = config::resolve_accounts(&config)?;
    let picked: Option<Account> = match account.as_deref() {
        Some(id) => accounts.into_iter().find(|a| a.account_id == id),
        None => {
            let single = accounts.len() == 1;
            let mut iter = accounts.into_iter();
            if single {
                iter.next()
            } else {
                iter.find(|a| a.account_id == DEFAULT_ACCOUNT_ID)
            }
        }
    };
    let account = picked.ok_or_else(|| {
        anyhow::anyhow!(
            "unknown account {}",
            account.as_deref().unwrap_or(DEFAULT_ACCOUNT_ID)
        )
    })?;
    Ok(SidecarClient::new(Arc::new(account), &settings))
}

async fn run_send(
    config_path: Option<PathBuf>,
    account: Option<String>,
    peer: String,
    text: String,
    media_url: Option<String>,
) -> anyhow::Result<()> {
    let client = client_for(config_path, account)?;
    match media_url {
        Some(url) => {
            let media = MediaMessage::from_url(url).with_caption(text);
            client.send_media(&peer, &media).await?;
            println!("media sent to {}", peer);
        }
        None => {
            if text.is_empty() {
                anyhow::bail!("--text or --media-url is required");
            }
            let sent = client.send_text(&peer, &text).await?;
            println!(
                "{}",
                serde_json::json!({ "messageId": sent.message_id, "timestamp": sent.timestamp_ms })
            );
        }
    }
    Ok(())
}

async fn run_health(config_path: Option<PathBuf>, account: Option<String>) -> anyhow::Result<bool> {
    let client = client_for(config_path, account)?;
    Ok(client.health_check().await)
}
