//! tideway demo server.
//!
//! Serves a greeting at `/`, a JSON chat room at `/ws` and files from
//! `--static-dir` under `/static/`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{header, HeaderValue, StatusCode};
use clap::Parser;
use serde::{Deserialize, Serialize};

use tideway::config::{load_config, ServerConfig};
use tideway::http::error::HandlerError;
use tideway::middleware::{Logger, RateLimit};
use tideway::observability::{logging, metrics};
use tideway::websocket::{Client, CloseCode, Opcode, Room, RoomError, RoomMessage, RoomOptions, Upgrader, WsError};
use tideway::{Backend, Request, ResponseWriter, Server};

#[derive(Parser, Debug)]
#[command(name = "tideway")]
#[command(about = "HTTP/1.1 and WebSocket server", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connection backend: threaded, reactor or delegated.
    #[arg(short, long)]
    backend: Option<Backend>,

    /// Address to listen on, overriding the configuration.
    #[arg(long)]
    bind: Option<String>,

    /// Directory served under /static/.
    #[arg(long, default_value = "public")]
    static_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ChatKind {
    Join,
    Leave,
    Message,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    kind: ChatKind,
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    text: String,
}

impl ChatMessage {
    fn to_room(&self, client: &Arc<Client>) -> Result<RoomMessage, HandlerError> {
        let data = serde_json::to_vec(self).map_err(HandlerError::other)?;
        Ok(RoomMessage::new(Arc::clone(client), data))
    }
}

fn chat_name(req: &Request) -> String {
    req.uri()
        .query()
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "name")
                .map(|(_, value)| value.into_owned())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn chat(
    room: &Room,
    upgrader: &Upgrader,
    read_buffer_size: usize,
    w: &mut dyn ResponseWriter,
    req: Request,
) -> Result<(), HandlerError> {
    let name = chat_name(&req);
    let client = Arc::new(upgrader.upgrade(w, &req).await?);

    let join = ChatMessage {
        kind: ChatKind::Join,
        name: name.clone(),
        text: String::new(),
    };
    room.broadcast_enter(join.to_room(&client)?)
        .await
        .map_err(HandlerError::other)?;

    let mut buf = vec![0u8; read_buffer_size];
    loop {
        let frame = match client.read(&mut buf).await {
            Ok((frame, _)) => frame,
            Err(WsError::Closed) => break,
            Err(err) => {
                tracing::debug!(client_id = %client.id(), error = %err, "Chat read failed");
                break;
            }
        };
        match frame.opcode {
            Opcode::Text => {
                let message = ChatMessage {
                    kind: ChatKind::Message,
                    name: name.clone(),
                    text: frame.text().unwrap_or_default().to_string(),
                };
                if let Err(err) = room.broadcast_message(message.to_room(&client)?).await {
                    tracing::debug!(error = %err, "Chat broadcast refused");
                    break;
                }
            }
            Opcode::Ping => {
                client.write(&frame.payload, Opcode::Pong).await?;
            }
            Opcode::Close => break,
            _ => {}
        }
    }

    let leave = ChatMessage {
        kind: ChatKind::Leave,
        name,
        text: String::new(),
    };
    if let Err(err) = room.broadcast_leave(leave.to_room(&client)?).await {
        tracing::debug!(error = %err, "Chat leave not broadcast");
    }
    if !client.is_closed() {
        let _ = client.close("bye", CloseCode::NORMAL).await;
    }
    Ok(())
}

fn build_server(config: ServerConfig, static_dir: PathBuf) -> Result<Server, Box<dyn std::error::Error>> {
    let upgrader = Arc::new(Upgrader::new(&config.websocket));
    let read_buffer_size = config.websocket.read_buffer_size;
    let room = Room::new(
        "chat",
        RoomOptions::default().on_error(|err: &RoomError| tracing::warn!(error = %err, "Chat room error")),
    );
    room.spawn();

    let rate_limit = config.rate_limit.clone();
    let mut server = Server::from_config(config);
    server.use_middleware(Logger);
    if rate_limit.enabled {
        server.use_middleware(RateLimit::from_config(&rate_limit));
    }
    server.handle_fn("GET /", |w, _req| {
        Box::pin(async move {
            let body = b"Hello from tideway\n";
            w.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
            w.set_header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
            w.send(StatusCode::OK, body).await?;
            Ok::<(), HandlerError>(())
        })
    })?;
    server.handle_fn("GET /ws", move |w, req| {
        let room = Arc::clone(&room);
        let upgrader = Arc::clone(&upgrader);
        Box::pin(async move { chat(&room, &upgrader, read_buffer_size, w, req).await })
    })?;
    server.serve_files("/static/", static_dir)?;
    Ok(server)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(backend) = cli.backend {
        config.listener.backend = backend;
    }
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tideway starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(err) = metrics::init_metrics(addr) {
                    tracing::error!(error = %err, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = build_server(config, cli.static_dir)?;
    server.listen_and_serve().await?;
    Ok(())
}
