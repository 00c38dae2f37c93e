use data_agent_orchestrator::{
    agent::TurnOrchestrator, api::start_server, config::Settings,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    info!("🚀 Data Agent Orchestrator - API Server");
    info!("📍 Port: {}", settings.port);
    info!(model = %settings.gemini_model, "Language model");

    let orchestrator = Arc::new(TurnOrchestrator::from_settings(&settings, true)?);

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    start_server(orchestrator, settings.port).await?;

    Ok(())
}
