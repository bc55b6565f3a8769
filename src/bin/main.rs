use finance_query_orchestrator::{
    agent::Agent,
    config::AgentConfig,
    models::{OutputShape, Request},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_QUESTION: &str = "What is our cash conversion cycle this quarter?";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // Usage: orchestrator [--shape summary|table|json] <question...>
    let mut shape = OutputShape::Summary;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--shape" | "-s" => {
                if let Some(value) = args.next() {
                    shape = OutputShape::from(value);
                }
            }
            _ => words.push(arg),
        }
    }
    let question = if words.is_empty() {
        DEFAULT_QUESTION.to_string()
    } else {
        words.join(" ")
    };

    info!("Finance Query Orchestrator starting");

    let config = AgentConfig::from_env()?;
    let agent = Agent::from_config(&config)?;

    info!(question = %question, shape = %shape, "Running request");

    match agent.run(Request::new(question, shape)).await {
        Ok(outcome) => {
            let report = &outcome.report;
            println!("\n=== REPORT ({}) ===", report.status);
            println!("Audit ID: {}", outcome.audit_id);
            println!("\n{}", report.narrative);
            if let Some(table) = &report.table {
                println!("\n{}", table);
            }
            if let Some(body) = &report.body {
                println!("\n{}", serde_json::to_string_pretty(body)?);
            }
            for marker in &report.markers {
                println!(
                    "  [{}] {}: {}",
                    marker.status,
                    marker.task_id,
                    marker.reason.as_deref().unwrap_or("")
                );
            }
            if !report.recommendations.is_empty() {
                println!("\nRecommended actions:");
                for r in &report.recommendations {
                    println!("  {} {} ({}, KPI {})", r.priority, r.title, r.owner, r.kpi);
                }
            }
            println!("\nReasoning Trace:");
            for (i, trace) in outcome.reasoning_trace.iter().enumerate() {
                println!("  {}: {}", i + 1, trace);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Request failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
