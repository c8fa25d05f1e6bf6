use env_logger::Env;
use schedule_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting schedule-collab on {} ({})",
        config.bind_addr,
        match &config.storage_path {
            Some(path) => format!("RocksDB at {}", path.display()),
            None => "in-memory".to_string(),
        }
    );

    let server = match CollabServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down; final stats: {:?}", server.stats());
        }
    }
}
