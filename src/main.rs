use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use serde_json::{json, Value};

use mfe_sync::storage::KeyValueStore;
use mfe_sync::{
    Bridge, BridgeConfig, BusConfig, GlobalStateStore, HostPrimitives, LocalBroadcastHub, LocalStorageArea,
    MeshConfig, MessageBus, SqliteStore, TransportKind, User,
};

#[derive(Parser)]
#[command(name = "mfe-sync")]
#[command(about = "Inspect and exercise the micro-frontend messaging core", version)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config,

    /// Print the state snapshot persisted in a sqlite store
    Snapshot {
        #[arg(long, value_name = "PATH")]
        db: PathBuf,

        /// Storage key, defaults to the configured one
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Wire two contexts together and run a request and a state change
    Demo {
        #[arg(short, long, value_enum, default_value = "broadcast")]
        transport: DemoTransport,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DemoTransport {
    None,
    Broadcast,
    Storage,
}

impl From<DemoTransport> for TransportKind {
    fn from(value: DemoTransport) -> Self {
        match value {
            DemoTransport::None => TransportKind::None,
            DemoTransport::Broadcast => TransportKind::Broadcast,
            DemoTransport::Storage => TransportKind::Storage,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => MeshConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => MeshConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }

        Commands::Snapshot { db, key } => {
            let key = key.unwrap_or_else(|| config.store.key.clone());
            let store = SqliteStore::open(&db).with_context(|| format!("opening {}", db.display()))?;
            match store.get_item(&key)? {
                Some(raw) => {
                    let value: Value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                    println!("{} {}", "✓".green(), key.bright_yellow());
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                None => {
                    println!("{} no snapshot under {}", "✗".red(), key.bright_yellow());
                }
            }
        }

        Commands::Demo { transport } => {
            demo(config, transport.into()).await?;
        }
    }

    Ok(())
}

/// Two contexts, each with its own bridge, bus and store. With no transport
/// they share one bridge instead.
async fn demo(config: MeshConfig, transport: TransportKind) -> Result<()> {
    let bridge_config = BridgeConfig {
        transport,
        ..config.bridge.clone()
    };
    let (left, right) = match transport {
        TransportKind::None => {
            let bridge = Bridge::new(bridge_config);
            (bridge.clone(), bridge)
        }
        TransportKind::Broadcast => {
            let hub = LocalBroadcastHub::new();
            let host = HostPrimitives::none().with_broadcast(Arc::new(hub));
            (
                Bridge::with_primitives(bridge_config.clone(), &host),
                Bridge::with_primitives(bridge_config, &host),
            )
        }
        TransportKind::Storage => {
            let area = LocalStorageArea::new();
            (
                Bridge::with_primitives(
                    bridge_config.clone(),
                    &HostPrimitives::none().with_storage(Arc::new(area.context())),
                ),
                Bridge::with_primitives(
                    bridge_config,
                    &HostPrimitives::none().with_storage(Arc::new(area.context())),
                ),
            )
        }
    };
    println!(
        "{} two contexts on {} ({:?})",
        "→".cyan(),
        left.prefix().bright_white(),
        transport
    );

    let shell = MessageBus::new(left.clone(), BusConfig::new("shell").with_timeout(Duration::from_secs(2)));
    let profile = MessageBus::new(right.clone(), BusConfig::new("profile"));

    let mut requests = profile.on("GET_PROFILE", Some("shell"));
    let responder = profile.clone();
    let serving = tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let id = request.payload["id"].as_str().unwrap_or("unknown").to_string();
            if let Err(err) = responder.respond(&request, &json!({"id": id, "name": "Ada"})) {
                tracing::warn!(error = %err, "failed to answer request");
            }
        }
    });

    let reply: Value = shell
        .send_with_response("profile", "GET_PROFILE", &json!({"id": "u1"}), None)
        .await?;
    println!("{} request/response: {}", "✓".green(), reply.to_string().bright_white());
    serving.abort();

    let writer = GlobalStateStore::new(left, config.store.clone());
    let reader = GlobalStateStore::new(right, config.store);
    let mut users = reader.select_user();
    users.next().await;

    writer.set_user(User::new("u1", "Ada").with_permissions(["read", "write"]));
    match tokio::time::timeout(Duration::from_secs(2), users.next()).await {
        Ok(Some(Some(user))) => {
            println!(
                "{} replicated user {} with permissions {:?}",
                "✓".green(),
                user.name.bright_white(),
                user.permissions
            );
        }
        _ => println!("{} state change did not replicate", "✗".red()),
    }

    Ok(())
}
