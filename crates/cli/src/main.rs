use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "vissgw")]
#[command(about = "VISS client gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the gateway (HTTP and WebSocket listeners in front of the manager channels).
    Gateway {
        /// Config file path (default: VISSGW_CONFIG_PATH or ~/.vissgw/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Plain HTTP port (default from config or 8888)
        #[arg(long)]
        http_port: Option<u16>,

        /// Plain WebSocket port (default from config or 8080)
        #[arg(long)]
        ws_port: Option<u16>,

        /// Answer every request with its own envelope instead of waiting for a server core.
        #[arg(long)]
        echo_hub: bool,
    },

    /// Open a WebSocket session and exchange lines typed on stdin (interactive).
    Probe {
        /// Gateway WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,

        /// Subprotocol to offer
        #[arg(long, default_value = "VISSv2")]
        subprotocol: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("vissgw {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Gateway {
            config,
            http_port,
            ws_port,
            echo_hub,
        }) => {
            if let Err(e) = run_gateway(config, http_port, ws_port, echo_hub).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Probe { url, subprotocol }) => {
            if let Err(e) = run_probe(&url, &subprotocol).await {
                log::error!("probe failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    http_port: Option<u16>,
    ws_port: Option<u16>,
    echo_hub: bool,
) -> anyhow::Result<()> {
    let (mut config, path) = vissgw::config::load_config(config_path)?;
    log::info!("config: {}", path.display());
    if let Some(p) = http_port {
        config.gateway.http_port = p;
    }
    if let Some(p) = ws_port {
        config.gateway.ws_port = p;
    }

    let (table, endpoints) =
        vissgw::hub::ManagerTable::new(config.hub.managers, config.hub.channel_buffer);
    // Held until the gateway stops so unanswered manager channels stay open.
    let mut _unattached = Vec::new();
    if echo_hub {
        log::info!("echo hub answering on {} manager channels", endpoints.len());
        for endpoint in endpoints {
            vissgw::hub::spawn_echo_hub(endpoint);
        }
    } else {
        log::warn!("no server core attached; run with --echo-hub for a self-contained gateway");
        _unattached = endpoints;
    }
    vissgw::gateway::run_gateway(config, table).await
}

async fn run_probe(url: &str, subprotocol: &str) -> anyhow::Result<()> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_str(subprotocol)?);
    let (ws, response) = tokio_tungstenite::connect_async(request).await?;
    let selected = response
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    println!("connected to {}, subprotocol {}", url, selected);

    let (mut sink, mut stream) = ws.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("/exit") || line.eq_ignore_ascii_case("/quit") {
                    break;
                }
                sink.send(Message::Text(line.to_string())).await?;
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => println!("< {}", text),
                    Some(Ok(Message::Binary(bytes))) => println!("< ({} bytes) {}", bytes.len(), String::from_utf8_lossy(&bytes)),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
    let _ = sink.close().await;
    Ok(())
}
