use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use uuid::Uuid;

mod clock;
mod config;
mod discovery;
mod gate;
mod http;
mod media;
mod member;
mod playback;
mod probe;
mod protocol;
mod registry;
mod room;
mod storage;
mod ws;

use config::Config;
use discovery::DiscoveryService;
use http::AppState;
use registry::RoomRegistry;
use storage::Storage;
use ws::Publisher;

fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!("  ╭─────────────────────────────────────────────╮");
    println!("  │                                             │");
    println!("  │   ▶  W A T C H   T O G E T H E R            │");
    println!("  │      One timeline, every screen             │");
    println!("  │                                             │");
    println!("  ├─────────────────────────────────────────────┤");
    println!("  │                                             │");
    println!("  │   Version:    {:<29} │", version);
    println!("  │   Port:       {:<29} │", config.port);
    println!("  │   Discovery:  udp/{:<25} │", config.discovery_port);
    println!("  │                                             │");
    println!("  ├─────────────────────────────────────────────┤");
    println!("  │                                             │");
    println!("  │   Endpoints:                                │");
    println!("  │     • ws://localhost:{:<5}/ws               │", config.port);
    println!("  │     • /api/health                           │");
    println!("  │     • /api/discovery                        │");
    println!("  │     • /api/rooms/:id/media                  │");
    println!("  │                                             │");
    println!("  ╰─────────────────────────────────────────────╯");
    println!();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchtogether_server=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let config = Arc::new(Config::from_env());
    let instance_id = Uuid::new_v4();

    print_banner(&config);
    tracing::info!("Instance id {instance_id}");
    if config.disable_compat_proxy {
        tracing::info!("Compat proxy disabled by environment");
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;
    let storage = Storage::new(config.storage_dir.clone());
    let publisher = Publisher::new();
    let registry = Arc::new(RoomRegistry::new(
        Arc::clone(&config),
        publisher.clone(),
        storage.clone(),
    ));
    registry.spawn_cleanup();

    let discovery = DiscoveryService::new(instance_id, Arc::clone(&config), Arc::clone(&registry));
    discovery.start();

    let state = AppState {
        registry,
        publisher,
        config: Arc::clone(&config),
        storage,
        instance_id,
    };
    let app = http::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
