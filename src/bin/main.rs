use financial_tool_orchestrator::{config::AppConfig, models::EventKind, runtime::Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SAMPLE_QUERY: &str = "What is Apple's stock price?";

/// Run one query end to end and print each stream event as a JSON line.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let query = if args.is_empty() {
        SAMPLE_QUERY.to_string()
    } else {
        args.join(" ")
    };

    let runtime = Runtime::from_config(AppConfig::from_env()?);
    info!(%query, "Running query");

    let mut source = runtime.chat(&query).await;
    println!("{}", serde_json::to_string(&source.selection)?);

    let mut status = String::from("error");
    while let Some(event) = source.recv().await {
        println!("{}", serde_json::to_string(&event)?);
        if event.kind == EventKind::Done {
            if let Some(s) = event.payload["status"].as_str() {
                status = s.to_string();
            }
        }
    }

    runtime.shutdown().await;

    if status == "ok" {
        Ok(())
    } else {
        Err(format!("session finished with status '{}'", status).into())
    }
}
