use anyhow::Result;
use serving_core::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("inference-gateway")?;
    info!(target: "inference-gateway", "Starting inference-gateway service");
    inference_gateway::run().await
}
