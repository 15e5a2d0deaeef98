//! wsusd - update server for Windows Update clients
//!
//! Serves the staged client-sync protocol over HTTP from a local metadata
//! store mirrored off an upstream catalog.

mod config;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use config::{BackendKind, ServerConfig};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wsusd_core::{
    DeltaStore, DeploySyncStore, DirStore, MetadataStore, PartitionRegistry, SqliteStore,
    SyncPolicy, UnapprovedDriverObserver, UpdateEngine, UpdateIdentity,
};
use wsusd_service::ClientService;

/// Surfaces drivers that matched a client but lack an approving deployment.
struct LoggingObserver;

impl UnapprovedDriverObserver for LoggingObserver {
    fn on_unapproved(&self, identity: &UpdateIdentity) {
        tracing::info!("driver {} matched but is not approved", identity);
    }
}

#[derive(Parser, Debug)]
#[command(name = "wsusd")]
#[command(version = "0.1.0")]
#[command(about = "Update server for Windows Update clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Configuration file (TOML)
        #[arg(short = 'c', long, default_value = "wsusd.toml")]
        config: String,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Create a default configuration file and an empty store
    Init {
        /// Config file path to write
        #[arg(short, long, default_value = "wsusd.toml")]
        output: String,
    },
}

fn open_store(config: &ServerConfig) -> Result<Arc<dyn MetadataStore>> {
    let registry = PartitionRegistry::builtin();
    let root = Path::new(&config.store_root);
    let store: Arc<dyn MetadataStore> = match config.backend {
        BackendKind::Delta => Arc::new(DeltaStore::open(root, &registry)?),
        BackendKind::Directory => Arc::new(DirStore::open(root, &registry)?),
        BackendKind::Sqlite => Arc::new(SqliteStore::open(&root.join("store.db"), &registry)?),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config, debug } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let config_path = Path::new(&config);
            let config = if config_path.exists() {
                info!("Loading config from {}", config_path.display());
                ServerConfig::from_file(config_path)?
            } else {
                info!("No config file at {}, using defaults", config_path.display());
                ServerConfig::default()
            };

            info!("Opening {:?} metadata store at {}", config.backend, config.store_root);
            let store = open_store(&config)?;

            let engine = Arc::new(UpdateEngine::new());
            engine.attach(store).await?;

            let deploy = Arc::new(DeploySyncStore::open(Path::new(&config.deploy_db))?);

            let policy = SyncPolicy {
                max_updates_in_response: config.max_updates_in_response,
                legacy_bundle_action: config.legacy_bundle_action,
            };
            let service = Arc::new(
                ClientService::new(engine, deploy)
                    .with_policy(policy)
                    .with_content_root(config.content_root.clone())
                    .with_observer(Arc::new(LoggingObserver)),
            );

            let addr: SocketAddr = config.listen.parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("Server listening on {}", addr);
            info!("Ready to accept update clients");

            loop {
                let (stream, _) = listener.accept().await?;
                let service = service.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| handle_request(req, service.clone())),
                        )
                        .await
                    {
                        error!("Error serving connection: {:?}", e);
                    }
                });
            }
        }

        Commands::Init { output } => {
            let config_path = Path::new(&output);
            if config_path.exists() {
                return Err(anyhow!("Config already exists at {}", output));
            }
            let config = ServerConfig::default();
            config.to_file(config_path)?;

            std::fs::create_dir_all(&config.store_root)?;
            let store = open_store(&config)?;
            store.flush().await?;
            DeploySyncStore::open(Path::new(&config.deploy_db))?;

            println!("Configuration file created: {}", output);
            println!("Empty {:?} store initialized at {}", config.backend, config.store_root);
            println!();
            println!("Start the server with:");
            println!("  wsusd start --config {}", output);
            Ok(())
        }
    }
}

/// Handle one HTTP request: route /client/* into the service layer.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    service: Arc<ClientService>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    info!("Request: {} {}", method, path);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!("Failed to read request body: {}", e);
            return Ok(Response::builder()
                .status(400)
                .body(Full::new(Bytes::from("Bad Request")))
                .unwrap());
        }
    };

    let response = match path.strip_prefix("/client") {
        Some(rest) => {
            wsusd_service::handle_client_request(rest, &method, &body, &service).await
        }
        None => Response::builder()
            .status(404)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap(),
    };

    info!("Response: {}", response.status());
    Ok(response)
}
