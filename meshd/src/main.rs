mod server;

use clap::Parser;
use tracing::{error, info};

use mesh_core::{logging, MeshConfig};

use server::MeshServer;

/// Service mesh node: registry, health checking, resolution, load
/// balancing, circuit breaking and peer synchronization.
#[derive(Debug, Parser)]
#[command(name = "meshd", version)]
struct Args {
    /// Path to a YAML configuration file.
    #[arg(long, env = "MESH_CONFIG_PATH")]
    config: Option<String>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

/// Generate a unique node id. Hostname plus a short random suffix keeps ids
/// readable in logs while avoiding collisions across restarts.
fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{host}-{}", nanoid::nanoid!(6))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // 1. Load and validate configuration (exit 2 on any misconfiguration).
    let config = match MeshConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(2);
        }
    };
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        std::process::exit(2);
    }

    if args.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => eprintln!("Failed to render configuration: {e}"),
        }
        return;
    }

    // 2. Initialize logging.
    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(2);
    }

    let node_id = generate_node_id();
    info!(node_id, bind_addr = %config.server.bind_addr, "meshd starting");

    // 3. Run until a shutdown signal; map failures onto the exit codes.
    let server = MeshServer::new(config, node_id);
    match server.run().await {
        Ok(()) => {
            info!("meshd stopped");
        }
        Err(e) => {
            error!("meshd failed: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
