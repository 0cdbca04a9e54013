pub mod classifier;
pub mod correction;
pub mod generator;
pub mod validator;

use crate::agent::classifier::QueryKind;
use crate::agent::correction::CorrectionLoop;
use crate::agent::generator::SqlGenerator;
use crate::config::AppConfig;
use crate::db::executor::{QueryResult, SqlExecutor};
use crate::db::inspector::SchemaInspector;
use crate::db::pool::ShippingDbManager;
use crate::error::AgentError;
use crate::history::selector::FewShotSelector;
use crate::history::HistoryStore;
use crate::llm::Completion;
use r2d2::Pool;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Final response to one question, whichever path produced it.
#[derive(Debug, Serialize)]
pub struct AgentAnswer {
    pub answer: String,
    pub kind: QueryKind,
    pub sql: Option<String>,
    pub result: Option<QueryResult>,
}

/// Entry point of the question-answering pipeline. Routes each question to
/// the SQL pipeline or the general-knowledge model and shapes the response.
pub struct Agent {
    inspector: Arc<SchemaInspector>,
    selector: FewShotSelector,
    correction: CorrectionLoop,
    general: Arc<dyn Completion>,
    few_shot_examples: usize,
    negative_examples: usize,
    request_timeout: Duration,
}

impl Agent {
    pub fn new(
        config: &AppConfig,
        pool: Pool<ShippingDbManager>,
        sql_client: Arc<dyn Completion>,
        general_client: Arc<dyn Completion>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let inspector = Arc::new(SchemaInspector::new(
            pool.clone(),
            Duration::from_secs(config.agent.schema_ttl_secs),
        ));
        let executor = SqlExecutor::new(
            pool,
            Duration::from_secs(config.database.statement_timeout_secs),
            config.database.max_rows,
        );
        let correction = CorrectionLoop::new(
            SqlGenerator::new(sql_client),
            executor,
            Arc::clone(&history),
            config.agent.max_retries,
        );

        Self {
            inspector,
            selector: FewShotSelector::new(history),
            correction,
            general: general_client,
            few_shot_examples: config.agent.few_shot_examples,
            negative_examples: config.agent.negative_examples,
            request_timeout: Duration::from_secs(config.agent.request_timeout_secs),
        }
    }

    pub async fn ask(&self, question: &str) -> Result<AgentAnswer, AgentError> {
        // Classification consults only the cached snapshot; a general
        // question never costs a database round trip.
        let terms = self
            .inspector
            .cached()
            .map(|snapshot| snapshot.terms())
            .unwrap_or_default();
        let kind = classifier::classify(question, &terms);
        info!("Question classified as {:?}", kind);

        match kind {
            QueryKind::GeneralKnowledge => self.answer_general(question).await,
            QueryKind::DataQuery => self.answer_data(question).await,
        }
    }

    async fn answer_general(&self, question: &str) -> Result<AgentAnswer, AgentError> {
        let prompt = format!(
            "You are a helpful assistant for a shipping and logistics company. \
             Answer the following question concisely.\n\nQuestion: {}\nAnswer:",
            question
        );
        let answer = self
            .general
            .complete(&prompt)
            .await
            .map_err(|e| AgentError::GeneralLlmUnavailable(e.to_string()))?;

        Ok(AgentAnswer {
            answer: answer.trim().to_string(),
            kind: QueryKind::GeneralKnowledge,
            sql: None,
            result: None,
        })
    }

    async fn answer_data(&self, question: &str) -> Result<AgentAnswer, AgentError> {
        // One snapshot serves the whole request; generation and validation
        // always agree on the schema they saw.
        let snapshot = self.inspector.fetch().await?;
        let positives = self.selector.select(question, self.few_shot_examples).await;
        let negatives = self
            .selector
            .negative_examples(question, self.negative_examples)
            .await;

        let run = self
            .correction
            .run(question, &snapshot, &positives, &negatives);
        let (sql, result) = match tokio::time::timeout(self.request_timeout, run).await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(AgentError::ExecutionTimeout(self.request_timeout)),
        };

        Ok(AgentAnswer {
            answer: format_answer(&result),
            kind: QueryKind::DataQuery,
            sql: Some(sql),
            result: Some(result),
        })
    }
}

/// Turns a query result into one line of prose. Counts get special-cased
/// because they are by far the most common question shape.
pub fn format_answer(result: &QueryResult) -> String {
    if result.rows.is_empty() {
        return "No matching records found.".to_string();
    }

    if result.row_count() == 1 && result.columns.len() == 1 {
        let column = &result.columns[0];
        let value = result.rows[0].get(column).unwrap_or(&Value::Null);
        if column.to_lowercase().contains("count") {
            return format!("Found {} matching records.", render_value(value));
        }
        return format!("{}: {}", column, render_value(value));
    }

    format!("Found {} matching record(s).", result.row_count())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::history::MemoryHistoryStore;
    use crate::llm::testing::StubCompletion;

    fn seeded_pool() -> Pool<ShippingDbManager> {
        let pool = Pool::builder()
            .max_size(1)
            .build(ShippingDbManager::new(":memory:".to_string(), false))
            .expect("pool");
        let conn = pool.get().expect("connection");
        conn.execute_batch(
            "CREATE TABLE shipment (id INTEGER, status VARCHAR, cost DOUBLE, shipment_date DATE); \
             INSERT INTO shipment VALUES \
                (1, 'pending', 10.5, DATE '2025-07-03'), \
                (2, 'delivered', 20.0, DATE '2025-07-21'), \
                (3, 'delivered', 7.25, DATE '2025-08-02');",
        )
        .expect("seed");
        drop(conn);
        pool
    }

    fn agent_with_pool(
        pool: Pool<ShippingDbManager>,
        sql: Arc<StubCompletion>,
        general: Arc<StubCompletion>,
    ) -> (Agent, Arc<MemoryHistoryStore>) {
        let history = Arc::new(MemoryHistoryStore::new());
        let agent = Agent::new(
            &AppConfig::default(),
            pool,
            sql,
            general,
            Arc::clone(&history) as Arc<dyn HistoryStore>,
        );
        (agent, history)
    }

    fn agent(
        sql: Arc<StubCompletion>,
        general: Arc<StubCompletion>,
    ) -> (Agent, Arc<MemoryHistoryStore>) {
        agent_with_pool(seeded_pool(), sql, general)
    }

    #[tokio::test]
    async fn data_question_runs_the_sql_pipeline_end_to_end() {
        let sql = Arc::new(StubCompletion::new([
            "```sql\nSELECT count(*) FROM shipment WHERE shipment_date >= '2025-07-01' AND shipment_date < '2025-08-01';\n```",
        ]));
        let general = Arc::new(StubCompletion::new(Vec::<String>::new()));
        let (agent, history) = agent(Arc::clone(&sql), Arc::clone(&general));

        let answer = agent
            .ask("How many shipments were made in July 2025?")
            .await
            .expect("ask");

        assert_eq!(answer.kind, QueryKind::DataQuery);
        assert_eq!(answer.answer, "Found 2 matching records.");
        assert!(answer.sql.as_deref().unwrap_or_default().contains("count(*)"));
        assert_eq!(history.positive().await.len(), 1);
        // The general model stayed out of it.
        assert!(general.prompts().is_empty());
    }

    #[tokio::test]
    async fn general_question_never_touches_the_database() {
        let sql = Arc::new(StubCompletion::new(Vec::<String>::new()));
        let general = Arc::new(StubCompletion::new(
            ["Supply chain management is the coordination of goods and logistics."],
        ));
        let (agent, history) = agent(Arc::clone(&sql), Arc::clone(&general));

        let answer = agent
            .ask("What is supply chain management?")
            .await
            .expect("ask");

        assert_eq!(answer.kind, QueryKind::GeneralKnowledge);
        assert!(answer.answer.contains("coordination of goods"));
        assert!(answer.sql.is_none());
        assert!(answer.result.is_none());
        assert!(sql.prompts().is_empty());
        assert!(history.positive().await.is_empty());
        assert!(history.negative().await.is_empty());

        let prompts = general.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("What is supply chain management?"));
    }

    #[tokio::test]
    async fn misspelled_identifier_is_corrected_on_retry() {
        let sql = Arc::new(StubCompletion::new([
            "SELECT shiment_id FROM shipment;",
            "SELECT id FROM shipment;",
        ]));
        let general = Arc::new(StubCompletion::new(Vec::<String>::new()));
        let (agent, history) = agent(Arc::clone(&sql), general);

        let answer = agent.ask("list shipment ids").await.expect("ask");

        assert_eq!(answer.sql.as_deref(), Some("SELECT id FROM shipment"));
        assert_eq!(history.negative().await.len(), 1);
        assert_eq!(history.positive().await.len(), 1);
        assert!(sql.prompts()[1].contains("unknown_identifier"));
    }

    #[tokio::test]
    async fn destructive_statements_exhaust_the_budget_without_executing() {
        let sql = Arc::new(StubCompletion::new([
            "SELECT count(*) FROM shipment; DELETE FROM shipment;",
            "SELECT count(*) FROM shipment; DELETE FROM shipment;",
            "SELECT count(*) FROM shipment; DELETE FROM shipment;",
        ]));
        let general = Arc::new(StubCompletion::new(Vec::<String>::new()));
        let pool = seeded_pool();
        let (agent, history) = agent_with_pool(pool.clone(), sql, general);

        let err = agent
            .ask("count shipments after deleting them")
            .await
            .expect_err("should exhaust");
        assert!(matches!(err, AgentError::RetryBudgetExhausted { .. }));
        assert_eq!(history.negative().await.len(), 3);

        // Nothing was deleted.
        let conn = pool.get().expect("connection");
        let remaining: i64 = conn
            .query_row("SELECT count(*) FROM shipment", [], |row| row.get(0))
            .expect("probe");
        assert_eq!(remaining, 3);
    }

    struct StalledCompletion;

    #[async_trait::async_trait]
    impl Completion for StalledCompletion {
        async fn complete(&self, _prompt: &str) -> Result<String, crate::llm::LlmError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("SELECT count(*) FROM shipment;".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_bounds_the_whole_retry_loop() {
        let mut config = AppConfig::default();
        config.agent.request_timeout_secs = 1;

        let history = Arc::new(MemoryHistoryStore::new());
        let agent = Agent::new(
            &config,
            seeded_pool(),
            Arc::new(StalledCompletion),
            Arc::new(StubCompletion::new(Vec::<String>::new())),
            Arc::clone(&history) as Arc<dyn HistoryStore>,
        );

        let err = agent
            .ask("how many shipments")
            .await
            .expect_err("should time out");
        assert!(matches!(err, AgentError::ExecutionTimeout(d) if d == Duration::from_secs(1)));
        // The stalled attempt never produced a statement to record.
        assert!(history.positive().await.is_empty());
        assert!(history.negative().await.is_empty());
    }

    #[tokio::test]
    async fn general_model_outage_is_reported() {
        let sql = Arc::new(StubCompletion::new(Vec::<String>::new()));
        let general = Arc::new(StubCompletion::failing("connection refused"));
        let (agent, _history) = agent(sql, general);

        let err = agent.ask("tell me a joke").await.expect_err("should fail");
        assert!(matches!(err, AgentError::GeneralLlmUnavailable(_)));
    }

    #[test]
    fn empty_results_read_as_no_matches() {
        let result = QueryResult {
            columns: vec!["id".to_string()],
            rows: vec![],
        };
        assert_eq!(format_answer(&result), "No matching records found.");
    }

    #[test]
    fn single_count_cell_reads_as_a_count() {
        let mut row = serde_json::Map::new();
        row.insert("count_star()".to_string(), Value::from(42));
        let result = QueryResult {
            columns: vec!["count_star()".to_string()],
            rows: vec![row],
        };
        assert_eq!(format_answer(&result), "Found 42 matching records.");
    }

    #[test]
    fn single_scalar_cell_reads_as_name_value() {
        let mut row = serde_json::Map::new();
        row.insert("max(cost)".to_string(), Value::from(99.5));
        let result = QueryResult {
            columns: vec!["max(cost)".to_string()],
            rows: vec![row],
        };
        assert_eq!(format_answer(&result), "max(cost): 99.5");
    }

    #[test]
    fn row_sets_read_as_a_found_summary() {
        let mut row = serde_json::Map::new();
        row.insert("id".to_string(), Value::from(1));
        row.insert("status".to_string(), Value::from("pending"));
        let result = QueryResult {
            columns: vec!["id".to_string(), "status".to_string()],
            rows: vec![row.clone(), row],
        };
        assert_eq!(format_answer(&result), "Found 2 matching record(s).");
    }
}
