use finance_query_orchestrator::{agent::Agent, api::start_server, config::AgentConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")))
        .init();

    let config = AgentConfig::from_env()?;
    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY not set; only keyword-routed questions can be planned");
    }

    info!("Finance Query Orchestrator - API Server");
    info!("Port: {}", config.port);

    let agent = Arc::new(Agent::from_config(&config)?);
    info!(capabilities = agent.catalog().len(), "Agent initialized");

    start_server(agent, config.port).await?;

    Ok(())
}
