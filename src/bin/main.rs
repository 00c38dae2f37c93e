//! Interactive console: one question per line, one session per process.

use data_agent_orchestrator::{agent::TurnOrchestrator, config::Settings};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Used when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .init();

    let settings = Settings::from_env()?;
    let orchestrator = TurnOrchestrator::from_settings(&settings, false)?;
    let session_id = Uuid::new_v4();

    info!(session_id = %session_id, "Data Agent Orchestrator starting");
    println!("Ask a question about your data (empty line or Ctrl-D to quit).");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            break;
        }

        let output = orchestrator.handle_turn(session_id, question).await?;

        println!("\n{}", output.answer);
        if !output.follow_ups.is_empty() {
            println!("\nYou could also ask:");
            for (i, follow_up) in output.follow_ups.iter().enumerate() {
                println!("  {}. {}", i + 1, follow_up);
            }
        }
        info!(scenario = %output.scenario, aborted = output.aborted, "Turn complete");
    }

    Ok(())
}
