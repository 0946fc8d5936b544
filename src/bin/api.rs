use financial_tool_orchestrator::{api::start_server, config::AppConfig, runtime::Runtime};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    if config.gemini_api_key.is_none() {
        eprintln!("GEMINI_API_KEY not set; LLM steps fall back to keyword routing");
    }
    if config.financial_api_base_url.is_none() {
        eprintln!("FINANCIAL_API_BASE_URL not set; quotes are served from offline data");
    }

    let port = config.port;
    info!("Financial Tool Orchestrator - API Server");
    info!("Port: {}", port);

    let runtime = Arc::new(Runtime::from_config(config));

    info!("Runtime initialized, starting API server");

    start_server(runtime, port).await?;

    Ok(())
}
