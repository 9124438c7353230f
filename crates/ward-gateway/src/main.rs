use anyhow::Result;
use clap::Parser;
use ward_gateway::{init_tracing, run_ward_gateway_server, WardGatewayCli};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = WardGatewayCli::parse();
    run_ward_gateway_server(cli).await
}
