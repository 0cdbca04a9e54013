use crate::agent::generator::SqlGenerator;
use crate::agent::validator::{self, ValidationVerdict};
use crate::db::executor::{QueryResult, SqlExecutor};
use crate::db::inspector::SchemaSnapshot;
use crate::error::AgentError;
use crate::history::{HistoryEntry, HistoryStore, Outcome};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Generate -> validate -> execute, with bounded retries. Every attempt that
/// produced a statement leaves a history record, success or failure, so the
/// learning corpus always reflects what actually happened.
pub struct CorrectionLoop {
    generator: SqlGenerator,
    executor: SqlExecutor,
    history: Arc<dyn HistoryStore>,
    max_retries: u32,
}

impl CorrectionLoop {
    pub fn new(
        generator: SqlGenerator,
        executor: SqlExecutor,
        history: Arc<dyn HistoryStore>,
        max_retries: u32,
    ) -> Self {
        Self {
            generator,
            executor,
            history,
            max_retries,
        }
    }

    /// Runs the loop to completion against a single schema snapshot. The
    /// snapshot never changes between attempts, so a retry is never chasing
    /// a moving target.
    pub async fn run(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
        positives: &[HistoryEntry],
        negatives: &[HistoryEntry],
    ) -> Result<(String, QueryResult), AgentError> {
        let mut prior_error: Option<String> = None;

        for attempt in 1..=self.max_retries + 1 {
            if attempt > 1 {
                info!("Retrying generation, attempt {}", attempt);
            }

            let candidate = self
                .generator
                .generate(question, schema, positives, negatives, prior_error.as_deref())
                .await?;

            let statement = match validator::validate(&candidate, schema) {
                ValidationVerdict::Accepted { normalized } => normalized,
                ValidationVerdict::Rejected { reason, detail } => {
                    let feedback = format!("{}: {}", reason, detail);
                    warn!("Attempt {} rejected by validator: {}", attempt, feedback);
                    self.record(HistoryEntry::failure(
                        question,
                        &candidate,
                        Outcome::ValidationRejected,
                        &feedback,
                    ))
                    .await;
                    if attempt > self.max_retries {
                        return Err(AgentError::RetryBudgetExhausted {
                            attempts: attempt,
                            last_error: feedback,
                        });
                    }
                    prior_error = Some(feedback);
                    continue;
                }
            };

            match self.executor.execute(&statement).await {
                Ok(result) => {
                    self.record(HistoryEntry::success(
                        question,
                        &statement,
                        result.row_count(),
                    ))
                    .await;
                    return Ok((statement, result));
                }
                Err(e) => {
                    let feedback = e.summary();
                    warn!("Attempt {} failed during execution: {}", attempt, feedback);
                    self.record(HistoryEntry::failure(
                        question,
                        &statement,
                        Outcome::ExecutionFailed,
                        &feedback,
                    ))
                    .await;
                    if attempt > self.max_retries {
                        return Err(AgentError::RetryBudgetExhausted {
                            attempts: attempt,
                            last_error: feedback,
                        });
                    }
                    prior_error = Some(feedback);
                }
            }
        }

        // The loop always returns from inside; max_retries + 1 >= 1.
        Err(AgentError::RetryBudgetExhausted {
            attempts: self.max_retries + 1,
            last_error: prior_error.unwrap_or_default(),
        })
    }

    /// History is an aid, not a dependency; a failed append is logged and
    /// the answer still goes out.
    async fn record(&self, entry: HistoryEntry) {
        if let Err(e) = self.history.append(entry).await {
            error!("Failed to append history record: {}", e);
        }
    }
}
