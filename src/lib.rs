pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod llm;
pub mod util;
