//! `parley serve`: Start the HTTP/WebSocket server.

use parley_config::AppConfig;
use parley_gateway::AppState;
use std::sync::Arc;

use crate::demo::DemoCallHandler;

pub async fn run(
    mut config: AppConfig,
    port_override: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = port_override {
        config.server.port = port;
        config.validate()?;
    }

    println!("parley");
    println!("   Listening: {}", config.server.bind_addr());
    println!("   Calls:     ws://{}/ws", config.server.bind_addr());

    let handler = Arc::new(DemoCallHandler::new(&config));
    parley_gateway::start(AppState::new(config, handler)).await?;

    Ok(())
}
