use clap::Parser;
use r2d2::Pool;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use shipquery::agent::Agent;
use shipquery::config::{AppConfig, CliArgs};
use shipquery::db::pool::ShippingDbManager;
use shipquery::error::AgentError;
use shipquery::history::{HistoryStore, JsonlHistoryStore};
use shipquery::llm::LlmManager;
use shipquery::util::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "Initializing DuckDB connection pool for {}",
        config.database.connection_string
    );
    let db_manager = ShippingDbManager::new(
        config.database.connection_string.clone(),
        config.database.read_only,
    );
    let pool = Pool::builder()
        .max_size(config.database.pool_size as u32)
        .build(db_manager)?;

    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm_manager = LlmManager::new(&config.llm)?;

    info!("Opening history logs in {}", config.history.dir);
    let history: Arc<dyn HistoryStore> =
        Arc::new(JsonlHistoryStore::open(Path::new(&config.history.dir))?);

    let agent = Agent::new(
        &config,
        pool,
        llm_manager.sql_client(),
        llm_manager.general_client(),
        history,
    );

    let question = match &args.question {
        Some(question) => question.clone(),
        None => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if question.is_empty() {
        error!("No question provided");
        return Err("no question provided".into());
    }

    match agent.ask(&question).await {
        Ok(answer) => {
            if let Some(sql) = &answer.sql {
                info!("Answered with SQL: {}", sql);
            }
            println!("{}", answer.answer);
            Ok(())
        }
        Err(e) => {
            report_failure(&e);
            Err(e.into())
        }
    }
}

fn report_failure(error: &AgentError) {
    match error {
        AgentError::RetryBudgetExhausted { attempts, .. } => {
            error!(
                "Could not produce a valid query after {} attempts: {}",
                attempts,
                error.summary()
            );
        }
        other => error!("{}", other.summary()),
    }
    println!("Sorry, I could not answer that question: {}", error.summary());
}
