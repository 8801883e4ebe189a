use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use relay::relay::{ClientEvent, ClientRole, ServerEvent};
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Chat relay server and clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the relay (HTTP API + WebSocket on one port).
    Serve {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config/PORT or 3000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat through a running relay as a chatbot client (interactive).
    Chat {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Provider key, e.g. gemini-25-flash, claude, chatgpt.
        #[arg(long)]
        provider: Option<String>,

        /// Previous socket id, to resume that session.
        #[arg(long, value_name = "ID")]
        resume: Option<String>,
    },

    /// List recent sessions of a running relay.
    Sessions {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Show key pool status of a running relay.
    Keys {
        /// Config file path (default: CHATRELAY_CONFIG_PATH or ~/.chatrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_filter = match cli.command {
        Some(Commands::Serve { .. }) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Some(Commands::Version) => {
            println!("chatrelay {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            provider,
            resume,
        }) => {
            if let Err(e) = run_chat(config, provider, resume).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Sessions { config }) => {
            if let Err(e) = run_sessions(config).await {
                log::error!("sessions failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Keys { config }) => {
            if let Err(e) = run_keys(config).await {
                log::error!("keys failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(config_path: Option<std::path::PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = relay::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!(
        "starting relay on {}:{} (config {})",
        config.server.bind,
        config.server.port,
        path.display()
    );
    relay::relay::run_relay(config).await
}

/// host:port of the relay described by the config; wildcard binds are reached via loopback.
fn relay_authority(config_path: Option<std::path::PathBuf>) -> anyhow::Result<String> {
    let (config, _) = relay::config::load_config(config_path)?;
    let bind = config.server.bind.trim();
    let host = if bind.is_empty() || bind == "0.0.0.0" || bind == "::" {
        "127.0.0.1"
    } else {
        bind
    };
    Ok(format!("{}:{}", host, config.server.port))
}

async fn get_json(url: &str) -> anyhow::Result<serde_json::Value> {
    let res = reqwest::get(url).await?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        anyhow::bail!("GET {} returned {}: {}", url, status, body);
    }
    Ok(res.json().await?)
}

async fn run_sessions(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let url = format!("http://{}/api/sessions", relay_authority(config_path)?);
    let sessions = get_json(&url).await?;
    let list = sessions.as_array().cloned().unwrap_or_default();
    if list.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for s in list {
        let field = |k: &str| s.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();
        println!(
            "{}  {}  {:<22}  {}",
            field("_id"),
            field("updatedAt"),
            field("aiProvider"),
            preview(&field("lastMessage"), 60)
        );
    }
    Ok(())
}

async fn run_keys(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let url = format!("http://{}/api/keys/status", relay_authority(config_path)?);
    let status = get_json(&url).await?;
    println!(
        "{} of {} key(s) active",
        status.get("activeKeys").and_then(|v| v.as_u64()).unwrap_or(0),
        status.get("totalKeys").and_then(|v| v.as_u64()).unwrap_or(0)
    );
    for k in status.get("keys").and_then(|v| v.as_array()).cloned().unwrap_or_default() {
        let blocked = k.get("isBlocked").and_then(|v| v.as_bool()).unwrap_or(false);
        println!(
            "{:<9} #{} {}  errors={}{}{}",
            k.get("family").and_then(|v| v.as_str()).unwrap_or("?"),
            k.get("index").and_then(|v| v.as_u64()).unwrap_or(0),
            k.get("keyPreview").and_then(|v| v.as_str()).unwrap_or(""),
            k.get("consecutiveErrors").and_then(|v| v.as_u64()).unwrap_or(0),
            if k.get("isCurrent").and_then(|v| v.as_bool()).unwrap_or(false) {
                "  current"
            } else {
                ""
            },
            if blocked {
                format!(
                    "  blocked until {}",
                    k.get("blockUntil").and_then(|v| v.as_str()).unwrap_or("?")
                )
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max {
        format!("{}...", line.chars().take(max).collect::<String>())
    } else {
        line.to_string()
    }
}

async fn send_event(ws: &mut WsStream, event: &ClientEvent) -> anyhow::Result<()> {
    ws.send(Message::Text(event.to_frame())).await?;
    Ok(())
}

/// Read frames until `done` accepts one, printing notifications seen on the way.
async fn wait_for<T>(
    ws: &mut WsStream,
    mut done: impl FnMut(&ServerEvent) -> Option<T>,
) -> anyhow::Result<T> {
    while let Some(msg) = ws.next().await {
        let Message::Text(text) = msg? else { continue };
        let event = match ServerEvent::parse(&text) {
            Ok(ev) => ev,
            Err(e) => {
                log::debug!("ignoring frame: {}", e);
                continue;
            }
        };
        if let Some(out) = done(&event) {
            return Ok(out);
        }
        match event {
            ServerEvent::PortalStatus { connected } => {
                println!("* portal {}", if connected { "connected" } else { "disconnected" });
            }
            ServerEvent::PortalNotification { message, .. } => println!("[portal] {}", message),
            ServerEvent::Shutdown {} => anyhow::bail!("relay is shutting down"),
            _ => {}
        }
    }
    anyhow::bail!("connection closed")
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    provider: Option<String>,
    resume: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let mut ws_url = format!("ws://{}/ws", relay_authority(config_path)?);
    if let Some(ref id) = resume {
        ws_url.push_str(&format!("?socketId={}", id));
    }
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    send_event(
        &mut ws,
        &ClientEvent::Identify {
            role: ClientRole::Chatbot,
        },
    )
    .await?;
    let (session_id, socket_id, history_length) = wait_for(&mut ws, |ev| match ev {
        ServerEvent::SessionInitialized {
            session_id,
            socket_id,
            history_length,
        } => Some((session_id.clone(), socket_id.clone(), *history_length)),
        _ => None,
    })
    .await?;
    println!(
        "session {} ({} earlier message(s)); resume with --resume {}",
        session_id, history_length, socket_id
    );
    println!("commands: /clear, /help [message], /exit");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/clear") {
            send_event(&mut ws, &ClientEvent::ClearHistory {}).await?;
            wait_for(&mut ws, |ev| matches!(ev, ServerEvent::HistoryCleared {}).then_some(())).await?;
            println!("* history cleared");
            continue;
        }
        if let Some(rest) = input.strip_prefix("/help") {
            send_event(
                &mut ws,
                &ClientEvent::RequestHelp {
                    message: rest.trim().to_string(),
                },
            )
            .await?;
            println!("* help requested");
            continue;
        }

        send_event(
            &mut ws,
            &ClientEvent::SendMessage {
                prompt: input.to_string(),
                images: Vec::new(),
                provider: provider.clone(),
            },
        )
        .await?;
        let (reply, failed) = wait_for(&mut ws, |ev| match ev {
            ServerEvent::BotReply { reply, error, .. } => {
                Some((reply.clone(), error.unwrap_or(false)))
            }
            _ => None,
        })
        .await?;
        if failed {
            eprintln!("chat error: {}", reply.trim());
        } else {
            println!("< {}", reply.trim());
        }
    }

    let _ = ws.close(None).await;
    Ok(())
}
