//! Admin server command (`repowatch serve`).

use anyhow::Result;

use repowatch::config::RepowatchConfig;
use repowatch::jobs::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config: RepowatchConfig,
    port: Option<u16>,
    dev: bool,
    no_workers: bool,
) -> Result<()> {
    let mut server = ServerConfig::new(config);
    if let Some(port) = port {
        server.port = port;
    }
    server.dev_mode = dev;
    server.workers = !no_workers;
    start_server(server).await
}
