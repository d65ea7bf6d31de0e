use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cli;
mod client;
mod config;
mod db;
mod error;
mod handlers;
mod ingress;
mod metrics;
mod models;
mod repository;
#[cfg(test)]
mod test_helpers;
mod ws;

use crate::config::{FileConfig, HousemateConfig, ReconnectPolicy, ServerConfig};
use crate::db::Database;
use crate::ingress::MessageIngress;
use crate::metrics::ServerMetrics;
use crate::repository::ChatRepository;
use crate::ws::{Broadcaster, SessionRegistry};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "housemate")]
#[command(about = "Direct messaging between housemates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.housemate)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the messaging server in the foreground
    Server(ServerArgs),

    /// Open an interactive socket session as a user
    Connect(ConnectArgs),

    /// Manage user profiles
    User {
        #[command(subcommand)]
        action: UserCommand,
    },
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (overrides config; 0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Clean start - reset database (prompt for confirmation)
    #[arg(long)]
    reset_db: bool,
}

#[derive(Parser)]
struct ConnectArgs {
    /// Socket URL (defaults to the configured server address)
    #[arg(long)]
    url: Option<String>,

    /// User to join as
    #[arg(long)]
    user_id: i64,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Insert or update a user profile
    Add {
        #[arg(long)]
        id: i64,

        #[arg(long)]
        name: String,

        #[arg(long)]
        picture: Option<String>,
    },
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Server runtime configuration
    pub server_config: Arc<ServerConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    pub repository: Arc<ChatRepository>,
    /// Live connections and their rooms
    pub registry: Arc<SessionRegistry>,
    pub ingress: Arc<MessageIngress>,
}

impl AppState {
    pub fn new(server_config: Arc<ServerConfig>, db: Arc<Database>) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let repository = Arc::new(ChatRepository::new(&db));
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), metrics.clone()));
        let ingress = Arc::new(MessageIngress::new(
            repository.clone(),
            broadcaster,
            metrics.clone(),
        ));

        Self {
            server_config,
            metrics,
            db,
            repository,
            registry,
            ingress,
        }
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        // Conversation store
        .route(
            "/api/conversations",
            get(handlers::list_conversations).post(handlers::open_conversation),
        )
        .route(
            "/api/messages",
            get(handlers::list_messages)
                .post(handlers::create_message)
                .put(handlers::mark_messages_read),
        )
        // Live socket
        .route("/socket", get(handlers::socket_handler))
        // Admin endpoints
        .route("/api/admin/stats", get(handlers::stats_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn init_logging(default_directive: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_file_config(config: &HousemateConfig) -> Result<FileConfig> {
    config::load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Failed to load configuration ({})",
                config.config_toml_path().display()
            )
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args, cli.data_dir).await,
        Commands::Connect(args) => {
            init_logging("warn");
            let config = HousemateConfig::new(cli.data_dir)?;
            let file_config = load_file_config(&config)?;
            let url = args.url.unwrap_or_else(|| {
                format!(
                    "ws://{}:{}/socket",
                    file_config.server.host, file_config.server.port
                )
            });
            let policy = ReconnectPolicy::from_file(&file_config.client);
            cli::connect_command(&url, args.user_id, policy).await
        }
        Commands::User {
            action: UserCommand::Add { id, name, picture },
        } => {
            init_logging("housemate=info,warn");
            let config = HousemateConfig::new(cli.data_dir)?;
            cli::user_add_command(&config, id, &name, picture).await
        }
    }
}

async fn run_server(args: ServerArgs, data_dir: Option<PathBuf>) -> Result<()> {
    // Setup logging
    init_logging(if args.debug {
        "housemate=debug,tower_http=debug,info"
    } else {
        "housemate=info,tower_http=info,warn"
    });

    info!("Starting Housemate Chat");

    let config = HousemateConfig::new(data_dir)?;
    let file_config = load_file_config(&config)?;

    // Handle database reset if requested
    if args.reset_db && config.db_path.exists() {
        println!("This will delete all stored conversations and messages!");
        print!("Are you sure? (yes/no): ");
        use std::io::{self, Write};
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if input.trim() == "yes" {
            config.reset_database()?;
            println!("Database reset.");
        } else {
            println!("Cancelled.");
        }
    }

    // Initialize database
    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);

    let server_config = Arc::new(ServerConfig::from_file(&file_config));
    info!(
        "Server config: send_channel_capacity={}",
        server_config.socket.send_channel_capacity
    );

    let app_state = AppState::new(server_config, db.clone());
    let registry_for_shutdown = app_state.registry.clone();
    let app = build_router(app_state);

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Housemate Chat listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/conversations?userId=       - List a user's conversations");
    info!("  POST   /api/conversations               - Open a conversation with a user");
    info!("  GET    /api/messages?conversationId=    - Conversation history");
    info!("  POST   /api/messages                    - Send a message (multipart)");
    info!("  PUT    /api/messages                    - Mark a conversation read");
    info!("  GET    /socket                          - Live messaging socket");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    let open = registry_for_shutdown.connection_count().await;
    if open > 0 {
        info!("Dropping {} open socket connections", open);
    }

    info!("Closing database...");
    db.pool.close().await;
    db.writer.close().await;

    info!("Shutdown complete");
    server_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    type TestSocket = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn spawn_server() -> (SocketAddr, AppState, tempfile::TempDir) {
        let (state, tmp) = test_helpers::test_app_state_with_pair().await;
        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state, tmp)
    }

    async fn open_socket(addr: SocketAddr) -> TestSocket {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/socket", addr))
            .await
            .unwrap();
        socket
    }

    async fn send(socket: &mut TestSocket, frame: serde_json::Value) {
        socket
            .send(WsMessage::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    async fn recv(socket: &mut TestSocket) -> serde_json::Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out waiting for event")
                .expect("socket closed")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn join_as(addr: SocketAddr, user_id: i64) -> TestSocket {
        let mut socket = open_socket(addr).await;
        send(
            &mut socket,
            serde_json::json!({ "event": "join_user_room", "data": user_id }),
        )
        .await;
        let ack = recv(&mut socket).await;
        assert_eq!(ack["event"], "connected");
        assert_eq!(ack["data"]["userId"], user_id);
        socket
    }

    async fn wait_for_connections(state: &AppState, want: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.registry.connection_count().await != want {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached the expected connection count");
    }

    #[tokio::test]
    async fn test_socket_message_flow() {
        let (addr, state, _tmp) = spawn_server().await;
        let mut ada = join_as(addr, 5).await;
        let mut grace = join_as(addr, 9).await;

        send(
            &mut ada,
            serde_json::json!({
                "event": "send_message",
                "data": { "senderId": 5, "receiverId": 9, "content": "hi", "tempId": "t-1" }
            }),
        )
        .await;

        let confirmed = recv(&mut ada).await;
        assert_eq!(confirmed["event"], "message_sent");
        assert_eq!(confirmed["data"]["tempId"], "t-1");
        assert_eq!(confirmed["data"]["content"], "hi");
        let conversation_id = confirmed["data"]["conversationId"].as_i64().unwrap();

        let delivered = recv(&mut grace).await;
        assert_eq!(delivered["event"], "new_message");
        assert_eq!(delivered["data"]["id"], confirmed["data"]["id"]);
        assert_eq!(delivered["data"]["sender"]["fullName"], "Ada");

        // Both watch the conversation; Grace reads it
        for socket in [&mut ada, &mut grace] {
            send(
                socket,
                serde_json::json!({ "event": "join_conversation", "data": conversation_id }),
            )
            .await;
        }
        wait_for_connections(&state, 2).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.registry.conversation_targets(conversation_id).await.len() != 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        send(
            &mut grace,
            serde_json::json!({
                "event": "mark_read",
                "data": { "conversationId": conversation_id, "userId": 9 }
            }),
        )
        .await;
        let receipt = recv(&mut ada).await;
        assert_eq!(receipt["event"], "messages_read");
        assert_eq!(receipt["data"]["conversationId"], conversation_id);
        assert_eq!(receipt["data"]["userId"], 9);

        let history = state.repository.list_messages(conversation_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].message.read);

        // Rejected send still answers with the tempId
        send(
            &mut ada,
            serde_json::json!({
                "event": "send_message",
                "data": { "senderId": 5, "receiverId": 404, "content": "?", "tempId": "t-2" }
            }),
        )
        .await;
        let rejected = recv(&mut ada).await;
        assert_eq!(rejected["event"], "message_error");
        assert_eq!(rejected["data"]["tempId"], "t-2");
    }

    async fn http(state: &AppState, req: axum::http::Request<axum::body::Body>) -> serde_json::Value {
        use tower::ServiceExt;
        let resp = build_router(state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_http_and_socket_sends_share_one_history() {
        let (addr, state, _tmp) = spawn_server().await;
        let mut grace = join_as(addr, 9).await;

        let boundary = "housemate-e2e-boundary";
        let form: String = [("senderId", "5"), ("receiverId", "9"), ("content", "over http")]
            .iter()
            .map(|(name, value)| {
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    boundary, name, value
                )
            })
            .chain(std::iter::once(format!("--{}--\r\n", boundary)))
            .collect();
        let posted = http(
            &state,
            axum::http::Request::builder()
                .method("POST")
                .uri("/api/messages")
                .header(
                    "content-type",
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(axum::body::Body::from(form))
                .unwrap(),
        )
        .await;
        assert_eq!(posted["success"], true);
        let conversation_id = posted["conversationId"].as_i64().unwrap();

        // The HTTP send is broadcast to the receiver's socket
        let delivered = recv(&mut grace).await;
        assert_eq!(delivered["event"], "new_message");
        assert_eq!(delivered["data"]["id"], posted["message"]["id"]);

        send(
            &mut grace,
            serde_json::json!({
                "event": "send_message",
                "data": {
                    "conversationId": conversation_id,
                    "senderId": 9,
                    "receiverId": 5,
                    "content": "over the socket",
                    "tempId": 1718000000123i64
                }
            }),
        )
        .await;
        let confirmed = recv(&mut grace).await;
        assert_eq!(confirmed["event"], "message_sent");
        assert_eq!(confirmed["data"]["tempId"], 1718000000123i64);
        assert_eq!(confirmed["data"]["conversationId"], conversation_id);

        let listed = http(
            &state,
            axum::http::Request::builder()
                .uri(format!("/api/messages?conversationId={}", conversation_id))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
        let history = listed["messages"].as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["id"], posted["message"]["id"]);
        assert_eq!(history[0]["content"], "over http");
        assert_eq!(history[1]["id"], confirmed["data"]["id"]);
        assert_eq!(history[1]["content"], "over the socket");
        assert!(history[0]["createdAt"].as_i64() <= history[1]["createdAt"].as_i64());
    }

    #[tokio::test]
    async fn test_disconnect_cleans_registry() {
        let (addr, state, _tmp) = spawn_server().await;
        let mut ada = join_as(addr, 5).await;
        let _grace = join_as(addr, 9).await;
        send(
            &mut ada,
            serde_json::json!({ "event": "join_conversation", "data": 1 }),
        )
        .await;
        wait_for_connections(&state, 2).await;

        ada.close(None).await.unwrap();
        drop(ada);

        wait_for_connections(&state, 1).await;
        assert_eq!(state.registry.online_user_count().await, 1);
        assert!(state.registry.user_targets(5).await.is_empty());
        assert!(state.registry.conversation_targets(1).await.is_empty());
        assert_eq!(state.metrics.snapshot().connections.active, 1);
    }

    #[tokio::test]
    async fn test_http_send_reaches_chat_client() {
        let (addr, state, _tmp) = spawn_server().await;
        let url = format!("ws://{}/socket", addr);
        let (client, mut events) = client::ChatClient::connect(url, 9, ReconnectPolicy::default());

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, ws::ServerEvent::Connected(ref p) if p.user_id == 9));

        let draft = models::MessageDraft {
            sender_id: Some(5),
            receiver_id: Some(9),
            content: Some("dinner at 7".to_string()),
            ..Default::default()
        };
        state.ingress.submit(&draft).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match delivered {
            ws::ServerEvent::NewMessage(view) => {
                assert_eq!(view.message.content.as_deref(), Some("dinner at 7"));
                assert_eq!(view.receiver.id, 9);
            }
            other => panic!("expected new_message, got {:?}", other),
        }

        client.close().await;
        wait_for_connections(&state, 0).await;
    }
}
