use clap::Parser;
use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the DuckDB database file holding the shipping data.
    pub connection_string: String,
    pub pool_size: usize,
    /// Open connections read-only. Disable only for local experiments.
    pub read_only: bool,
    /// Per-statement execution timeout, seconds.
    pub statement_timeout_secs: u64,
    /// Hard cap on rows returned by a single query.
    pub max_rows: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    /// "ollama" or "remote"
    pub backend: String,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    /// Model used for SQL generation.
    pub sql_model: String,
    /// Model used for general-knowledge answers.
    pub general_model: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    /// Regeneration attempts allowed after the first failed one.
    pub max_retries: u32,
    /// Bounds the whole retry loop, not a single attempt.
    pub request_timeout_secs: u64,
    /// How many positive few-shot examples go into the prompt.
    pub few_shot_examples: usize,
    /// How many negative examples go into the prompt.
    pub negative_examples: usize,
    /// Schema snapshot time-to-live, seconds.
    pub schema_ttl_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Directory holding the positive/negative JSONL logs.
    pub dir: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub history: HistoryConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Question to answer; reads one line from stdin when omitted
    #[arg(short, long)]
    pub question: Option<String>,

    /// Path to the shipping database
    #[arg(long)]
    pub database: Option<String>,

    /// Directory for the learning history logs
    #[arg(long)]
    pub history_dir: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        // Defaults first so a missing config file still yields a runnable setup
        let mut config_builder =
            Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/shipquery/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // Build the config
        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(database) = &args.database {
            config.database.connection_string = database.clone();
        }
        if let Some(history_dir) = &args.history_dir {
            config.history.dir = history_dir.clone();
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                connection_string: "shipping.duckdb".to_string(),
                pool_size: 5,
                read_only: true,
                statement_timeout_secs: 30,
                max_rows: 1000,
            },
            llm: LlmConfig {
                backend: "ollama".to_string(),
                api_url: None,
                api_key: None,
                sql_model: "deepseek-coder:6.7b-instruct".to_string(),
                general_model: "mistral".to_string(),
                request_timeout_secs: 120,
            },
            agent: AgentConfig {
                max_retries: 2,
                request_timeout_secs: 300,
                few_shot_examples: 3,
                negative_examples: 2,
                schema_ttl_secs: 300,
            },
            history: HistoryConfig {
                dir: "history".to_string(),
            },
        }
    }
}
