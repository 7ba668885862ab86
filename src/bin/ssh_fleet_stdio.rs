#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem_mcpserver::McpServer;
use ssh_fleet::fleet::{FleetService, McpFleetCommands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // stdout carries the MCP protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let service = Arc::new(FleetService::from_env().await?);
    service.start().await?;

    poem_mcpserver::stdio::stdio(McpServer::new().tools(McpFleetCommands::new(service.clone())))
        .await?;

    service.shutdown().await;
    Ok(())
}
