//! `bridge-node` – run a single bridge node from a JSON config file.

use anyhow::{Context, Result};
use bridge_runtime::{init_tracing, Bridge, BridgeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))?
        }
        None => BridgeConfig::default(),
    };

    let bind = config.bind.clone();
    let bridge = Bridge::start(config).await?;
    let result = bridge.serve(&bind).await;
    bridge.shutdown().await?;
    result
}
