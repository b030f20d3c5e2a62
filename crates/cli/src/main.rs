use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::AsyncBufReadExt;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "newbot")]
#[command(about = "Newbot CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, workspace AGENTS.md).
    Init {
        /// Config file path (default: NEWBOT_CONFIG_PATH or ~/.newbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (WebSocket chat transport + HTTP side channel).
    Gateway {
        /// Config file path (default: NEWBOT_CONFIG_PATH or ~/.newbot/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 8000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat through the gateway as a WebSocket client (interactive; replies stream as they arrive).
    Chat {
        /// Config file path, used to find the gateway address
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Client id to connect as
        #[arg(long, value_name = "ID", default_value = "cli-client")]
        client_id: String,

        /// Gateway base URL (default: from config)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// List connected client ids.
    Clients {
        /// Gateway base URL
        #[arg(long, value_name = "URL", default_value = newbot::client::DEFAULT_GATEWAY_URL)]
        url: String,
    },

    /// Push a message to one connected client.
    Send {
        /// Target client id
        #[arg(long, short = 'c', value_name = "ID")]
        client: String,

        /// Message text
        #[arg(long, short, value_name = "TEXT")]
        message: String,

        /// Gateway base URL
        #[arg(long, value_name = "URL", default_value = newbot::client::DEFAULT_GATEWAY_URL)]
        url: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Commands::Gateway { .. }) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("newbot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Gateway { config, port }) => run_gateway(config, port).await,
        Some(Commands::Chat { config, client_id, url }) => run_chat(config, client_id, url).await,
        Some(Commands::Clients { url }) => run_clients(url).await,
        Some(Commands::Send { client, message, url }) => run_send(url, client, message).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(newbot::config::default_config_path);
    let dir = newbot::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = newbot::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    newbot::gateway::run_gateway(config, path).await
}

async fn run_clients(url: String) -> anyhow::Result<()> {
    let ids = newbot::client::ControlClient::new(url).list_clients().await?;
    if ids.is_empty() {
        println!("no connected clients");
    }
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

async fn run_send(url: String, client_id: String, message: String) -> anyhow::Result<()> {
    let res = newbot::client::ControlClient::new(url)
        .send_message(&client_id, &message)
        .await?;
    if res.ok {
        println!("sent to {}", client_id);
        Ok(())
    } else {
        anyhow::bail!(res.error.unwrap_or_else(|| "send failed".to_string()))
    }
}

async fn run_chat(config_path: Option<PathBuf>, client_id: String, url: Option<String>) -> anyhow::Result<()> {
    let base = match url {
        Some(u) => u,
        None => {
            let (config, _) = newbot::config::load_config(config_path)?;
            format!("http://{}:{}", config.gateway.bind.trim(), config.gateway.port)
        }
    };
    let ws_url = newbot::client::ws_url(&base, &client_id);
    let (ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    println!("connected to {} as {} (/quit to exit)", ws_url, client_id);
    let (mut write, mut read) = ws.split();

    // Replies have no end marker; print frames as they arrive.
    let reader = tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                Ok(Message::Close(frame)) => {
                    match frame {
                        Some(f) => eprintln!("\nconnection closed: {} {}", u16::from(f.code), f.reason),
                        None => eprintln!("\nconnection closed"),
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("\nconnection error: {}", e);
                    break;
                }
            }
        }
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if reader.is_finished() {
            break;
        }
        write.send(Message::Text(input.to_string())).await?;
        println!();
    }
    let _ = write.send(Message::Close(None)).await;
    reader.abort();
    Ok(())
}
