#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use ssh_fleet::fleet::{FleetService, McpFleetCommands};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let service = Arc::new(FleetService::from_env().await?);
    service.start().await?;

    // Setup MCP server
    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let tools_service = service.clone();
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| {
                McpServer::new().tools(McpFleetCommands::new(tools_service.clone()))
            }),
        )
        .with(Tracing);

    info!("MCP Server with SSH fleet support is ready");
    info!("Use fleet_test_connection to diagnose a target and fleet_queue_stats to inspect scheduling");

    Server::new(TcpListener::bind(mcp_addr))
        .name("SSH Fleet MCP Server")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
            },
            None,
        )
        .await?;

    service.shutdown().await;
    Ok(())
}
