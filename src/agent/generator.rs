use crate::db::inspector::SchemaSnapshot;
use crate::error::AgentError;
use crate::history::HistoryEntry;
use crate::llm::Completion;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Builds the generation prompt, invokes the SQL model and extracts a
/// candidate statement from whatever the model wrapped it in. The least
/// deterministic step in the pipeline; the validator and correction loop
/// exist to bound its unreliability.
pub struct SqlGenerator {
    client: Arc<dyn Completion>,
}

impl SqlGenerator {
    pub fn new(client: Arc<dyn Completion>) -> Self {
        Self { client }
    }

    pub async fn generate(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        positives: &[HistoryEntry],
        negatives: &[HistoryEntry],
        prior_error: Option<&str>,
    ) -> Result<String, AgentError> {
        let prompt = build_prompt(question, schema, positives, negatives, prior_error);
        debug!("SQL generation prompt:\n{}", prompt);

        let completion = self.client.complete(&prompt).await?;
        debug!("Raw model output:\n{}", completion);

        extract_sql(&completion).ok_or(AgentError::GenerationUnparseable)
    }
}

fn build_prompt(
    question: &str,
    schema: &SchemaSnapshot,
    positives: &[HistoryEntry],
    negatives: &[HistoryEntry],
    prior_error: Option<&str>,
) -> String {
    let mut prompt = String::from(
        r#"### Instructions:
Your task is to convert a question into a single read-only SQL query, given a database schema.
Adhere to these rules:
- **Use only the tables and columns in the schema below, with their exact spelling**
- **Generate exactly one SELECT statement; never modify data or schema**
- **Double-quote any identifier that collides with a SQL keyword** (for example `"order"`)
- **Use table aliases** to prevent ambiguity when joining
- When creating a ratio, always cast the numerator as float

### Schema:
"#,
    );
    prompt.push_str(&schema.to_prompt_listing());

    if !positives.is_empty() {
        prompt.push_str("\n### Examples:\n");
        for example in positives {
            prompt.push_str(&format!(
                "User's request: {}\nSQL: {}\n\n",
                example.question, example.sql
            ));
        }
    }

    if !negatives.is_empty() {
        prompt.push_str("\n### Known bad queries (do not repeat these mistakes):\n");
        for example in negatives {
            prompt.push_str(&format!(
                "User's request: {}\nBad SQL: {}\n-- rejected: {}\n\n",
                example.question,
                example.sql,
                example.error.as_deref().unwrap_or("failed")
            ));
        }
    }

    if let Some(error) = prior_error {
        prompt.push_str(&format!(
            "\n### Previous attempt failed:\n{}\nGenerate a corrected query that avoids this error.\n",
            error
        ));
    }

    prompt.push_str(&format!(
        "\n### Input:\nGenerate a SQL query that answers the question `{}`.\n\n### Response:\n```sql\n",
        question
    ));
    prompt
}

/// Pulls a read-only statement out of a model response, tolerating fenced
/// code blocks, prose and stray special tokens.
pub fn extract_sql(content: &str) -> Option<String> {
    let stray_tokens = Regex::new(r"(?i)\s*</?s>\s*").ok()?;
    let content = stray_tokens.replace_all(content, " ");
    let content = content.trim();

    // Fenced ```sql block first
    if let Some(start) = content.find("```sql") {
        let after = &content[start + 6..];
        if let Some(end) = after.find("```") {
            if let Some(sql) = finalize(&after[..end]) {
                return Some(sql);
            }
        } else if let Some(sql) = finalize(after) {
            // Prompt ends with an opening fence the model never closed
            return Some(sql);
        }
    }

    // Bare fences next
    if let Some(start) = content.find("```") {
        let after = &content[start + 3..];
        if let Some(end) = after.find("```") {
            if let Some(sql) = finalize(&after[..end]) {
                return Some(sql);
            }
        }
    }

    // Otherwise scan for a SELECT/WITH-led statement and collect it through
    // its terminating semicolon.
    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let upper = line.trim().to_uppercase();
        if upper.starts_with("SELECT") || upper.starts_with("WITH") {
            let mut sql = line.trim().to_string();
            if !sql.ends_with(';') {
                for next_line in &lines[i + 1..] {
                    let next = next_line.trim();
                    if next.starts_with("```") {
                        break;
                    }
                    sql.push(' ');
                    sql.push_str(next);
                    if next.ends_with(';') {
                        break;
                    }
                }
            }
            return finalize(&sql);
        }
    }

    None
}

fn finalize(raw: &str) -> Option<String> {
    let sql = raw.replace('`', "");
    let sql = sql.trim();
    let upper = sql.to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        Some(sql.to_string())
    } else {
        None
    }
}
