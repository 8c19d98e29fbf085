use anyhow::Result;
use log::info;
use p2p_stream::config::RelayConfig;
use p2p_stream::signaling::RelayServer;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = RelayConfig::from_env();
    info!(
        "Starting signaling relay (ws: {}, http: {})",
        config.relay_port, config.http_port
    );

    let server = RelayServer::new(config);
    server.run().await?;
    Ok(())
}
