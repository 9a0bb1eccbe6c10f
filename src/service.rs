use crate::catalog::LevelCatalog;
use crate::compare::rows_match;
use crate::error::QueryFailure;
use crate::model::{Level, QueryResult, Row};
use crate::sandbox::{is_interrupt_error, SandboxPool};
use crate::validator::validate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

const CORRECT_FEEDBACK: &str = "Excellent! Your query returned the correct results.";

struct Graded {
    rows: Vec<Row>,
    is_correct: bool,
    feedback: String,
    score_earned: Option<u32>,
}

/// Runs learner queries: validate, sandbox, execute, grade.
pub struct QueryService {
    catalog: Arc<LevelCatalog>,
    pool: SandboxPool,
    query_timeout: Option<Duration>,
}

impl QueryService {
    pub fn new(catalog: Arc<LevelCatalog>, pool: SandboxPool, query_timeout: Option<Duration>) -> Self {
        Self {
            catalog,
            pool,
            query_timeout,
        }
    }

    pub fn catalog(&self) -> &LevelCatalog {
        &self.catalog
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Never fails: every outcome, errors included, is a `QueryResult`.
    pub fn execute_query(&self, session_id: &str, level_id: u32, query: &str) -> QueryResult {
        let started = Instant::now();
        let outcome = self.run(session_id, level_id, query);
        let execution_time = elapsed_ms(started);

        match outcome {
            Ok(graded) => {
                debug!(
                    session_id,
                    level_id,
                    rows = graded.rows.len(),
                    correct = graded.is_correct,
                    elapsed_ms = execution_time,
                    "query graded"
                );
                QueryResult {
                    success: true,
                    data: Some(graded.rows),
                    error: None,
                    execution_time,
                    is_correct: Some(graded.is_correct),
                    feedback: Some(graded.feedback),
                    score_earned: graded.score_earned,
                }
            }
            Err(failure) => {
                if let QueryFailure::System(err) = &failure {
                    error!(session_id, level_id, error = %err, "query execution failed");
                } else {
                    debug!(session_id, level_id, error = %failure, "query rejected");
                }
                QueryResult::failed(failure.to_string(), execution_time)
            }
        }
    }

    fn run(&self, session_id: &str, level_id: u32, query: &str) -> Result<Graded, QueryFailure> {
        let level = self.catalog.get(level_id).ok_or(QueryFailure::UnknownLevel)?;
        validate(query)?;

        let sandbox = self.pool.acquire(session_id, level)?;
        debug!(key = %sandbox.key(), sandbox_id = sandbox.id(), "executing query");
        let rows = sandbox
            .query(query.trim(), self.query_timeout)
            .map_err(|e| self.engine_failure(&e))?;

        Ok(grade(level, rows))
    }

    fn engine_failure(&self, err: &rusqlite::Error) -> QueryFailure {
        match self.query_timeout {
            Some(limit) if is_interrupt_error(err) => QueryFailure::Engine(format!(
                "query exceeded the {} ms execution limit",
                limit.as_millis()
            )),
            _ => QueryFailure::Engine(err.to_string()),
        }
    }
}

fn grade(level: &Level, rows: Vec<Row>) -> Graded {
    if rows_match(&rows, &level.expected_result) {
        return Graded {
            rows,
            is_correct: true,
            feedback: CORRECT_FEEDBACK.to_string(),
            score_earned: Some(level.max_score),
        };
    }
    let feedback = format!(
        "Query executed successfully but results don't match expected output. \
         Expected {} rows, got {} rows.",
        level.expected_result.len(),
        rows.len()
    );
    Graded {
        rows,
        is_correct: false,
        feedback,
        score_earned: None,
    }
}

pub fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxSettings;
    use serde_json::json;
    use tokio::runtime::Handle;

    fn service() -> QueryService {
        service_with(LevelCatalog::builtin(), Some(Duration::from_secs(2)))
    }

    fn service_with(catalog: LevelCatalog, timeout: Option<Duration>) -> QueryService {
        let pool = SandboxPool::new(SandboxSettings::default(), Handle::current());
        QueryService::new(Arc::new(catalog), pool, timeout)
    }

    #[tokio::test]
    async fn first_select_is_correct() {
        let svc = service();
        let result = svc.execute_query("s1", 1, "SELECT * FROM users;");
        assert!(result.success);
        assert_eq!(result.is_correct, Some(true));
        assert_eq!(result.score_earned, Some(100));
        assert_eq!(result.data.as_ref().map(Vec::len), Some(3));
        assert_eq!(result.feedback.as_deref(), Some(CORRECT_FEEDBACK));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn every_builtin_solution_is_accepted() {
        let svc = service();
        let levels: Vec<(u32, String, u32)> = svc
            .catalog()
            .levels()
            .map(|l| (l.id, l.solution.clone().expect("solution"), l.max_score))
            .collect();
        for (id, solution, max_score) in levels {
            let result = svc.execute_query("solver", id, &solution);
            assert!(result.success, "level {id}: {:?}", result.error);
            assert_eq!(result.is_correct, Some(true), "level {id}: {:?}", result.data);
            assert_eq!(result.score_earned, Some(max_score), "level {id}");
        }
    }

    #[tokio::test]
    async fn forbidden_query_never_provisions() {
        let svc = service();
        let result = svc.execute_query("s1", 1, "DROP TABLE users;");
        assert!(!result.success);
        assert_eq!(result.is_correct, Some(false));
        assert!(result.data.is_none());
        assert!(result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("forbidden operations")));

        let result = svc.execute_query("s1", 1, "INSERT INTO users VALUES (9, 'x', 'y', 1)");
        assert_eq!(
            result.error.as_deref(),
            Some("Query must start with SELECT or WITH statement.")
        );
        assert_eq!(svc.pool().len(), 0);
        assert_eq!(svc.pool().provisioned_total(), 0);
    }

    #[tokio::test]
    async fn unknown_level_is_reported() {
        let svc = service();
        for id in [0, 101, 5000] {
            let result = svc.execute_query("s1", id, "SELECT 1");
            assert!(!result.success);
            assert_eq!(result.error.as_deref(), Some("Invalid level"));
            assert_eq!(result.is_correct, Some(false));
        }
        assert_eq!(svc.pool().len(), 0);
    }

    #[tokio::test]
    async fn engine_errors_are_prefixed() {
        let svc = service();
        let result = svc.execute_query("s1", 1, "SELECT * FROM nonexistent;");
        assert!(!result.success);
        let error = result.error.unwrap_or_default();
        assert!(error.starts_with("SQL Error:"), "{error}");
        assert!(error.contains("nonexistent"), "{error}");

        let result = svc.execute_query("s1", 1, "SELECT FROM WHERE");
        assert!(result.error.unwrap_or_default().starts_with("SQL Error:"));
    }

    #[tokio::test]
    async fn filter_level_grades_row_sets() {
        let svc = service();
        let good = svc.execute_query("s1", 8, "SELECT * FROM sample_table WHERE value >= 200;");
        assert!(good.success);
        assert_eq!(good.data.as_ref().map(Vec::len), Some(2));
        assert_eq!(good.is_correct, Some(true));

        let bad = svc.execute_query("s1", 8, "SELECT * FROM sample_table;");
        assert!(bad.success);
        assert_eq!(bad.data.as_ref().map(Vec::len), Some(3));
        assert_eq!(bad.is_correct, Some(false));
        assert_eq!(bad.score_earned, None);
        assert!(bad
            .feedback
            .as_deref()
            .is_some_and(|f| f.contains("Expected 2 rows, got 3 rows.")));
    }

    #[tokio::test]
    async fn ordering_does_not_affect_grading() {
        let svc = service();
        let asc = svc.execute_query("s1", 9, "SELECT * FROM sample_table ORDER BY value ASC");
        assert_eq!(asc.is_correct, Some(true));
    }

    #[tokio::test]
    async fn wrong_columns_are_incorrect_with_matching_count() {
        let svc = service();
        let result = svc.execute_query("s1", 1, "SELECT id, name FROM users");
        assert!(result.success);
        assert_eq!(result.is_correct, Some(false));
        assert!(result
            .feedback
            .as_deref()
            .is_some_and(|f| f.contains("Expected 3 rows, got 3 rows.")));
    }

    #[tokio::test]
    async fn sessions_do_not_share_mutations() {
        let svc = service();
        // The prefix check lets CTE-led writes through; the sandbox keeps them contained.
        let write = svc.execute_query(
            "mallory",
            1,
            "WITH gone AS (SELECT 1) UPDATE users SET name = 'pwned'",
        );
        assert!(write.success, "{:?}", write.error);

        let mine = svc.execute_query("mallory", 1, "SELECT * FROM users");
        assert_eq!(mine.is_correct, Some(false));

        let theirs = svc.execute_query("alice", 1, "SELECT * FROM users");
        assert_eq!(theirs.is_correct, Some(true));
        let data = theirs.data.unwrap_or_default();
        assert_eq!(data[0]["name"], json!("Alice Johnson"));
    }

    #[tokio::test]
    async fn runaway_queries_hit_the_time_cap() {
        let svc = service_with(LevelCatalog::builtin(), Some(Duration::from_millis(50)));
        let result = svc.execute_query(
            "s1",
            1,
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c",
        );
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("SQL Error: query exceeded the 50 ms execution limit")
        );
    }

    #[tokio::test]
    async fn whole_real_values_grade_as_integers() -> anyhow::Result<()> {
        let mut level = LevelCatalog::builtin().get(1).cloned().expect("level 1");
        let rows: Vec<Row> = vec![
            [("id".to_string(), json!(1)), ("price".to_string(), json!(100))].into_iter().collect(),
            [("id".to_string(), json!(2)), ("price".to_string(), json!(300))].into_iter().collect(),
        ];
        level.tables[0].name = "items".into();
        level.tables[0].schema = [("id", "INTEGER"), ("price", "REAL")]
            .into_iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect();
        level.tables[0].data = rows.clone();
        level.expected_result = rows;
        let catalog = LevelCatalog::from_levels(vec![level])?;

        let svc = service_with(catalog, None);
        let result = svc.execute_query("s1", 1, "SELECT * FROM items");
        assert_eq!(result.is_correct, Some(true), "{:?}", result.data);
        let data = result.data.unwrap_or_default();
        assert_eq!(data[0]["price"], json!(100));

        let result = svc.execute_query("s1", 1, "SELECT id, price * 1.0 AS price FROM items");
        assert_eq!(result.is_correct, Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn setup_failures_are_system_errors() -> anyhow::Result<()> {
        let mut level = LevelCatalog::builtin().get(1).cloned().expect("level 1");
        level.tables[0].schema.insert("email".into(), "TEXT NOT NULL".into());
        level.tables[0].data[1].insert("email".into(), serde_json::Value::Null);
        let catalog = LevelCatalog::from_levels(vec![level])?;

        let svc = service_with(catalog, None);
        let result = svc.execute_query("s1", 1, "SELECT * FROM users");
        assert!(!result.success);
        assert_eq!(result.is_correct, Some(false));
        let error = result.error.unwrap_or_default();
        assert!(error.starts_with("System error:"), "{error}");
        assert!(error.contains("NOT NULL"), "{error}");
        assert_eq!(svc.pool().len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn execution_time_is_always_present() -> anyhow::Result<()> {
        let svc = service();
        for (level, query) in [(1, "SELECT * FROM users"), (1, "DROP TABLE users"), (0, "SELECT 1")] {
            let result = svc.execute_query("s1", level, query);
            let json = serde_json::to_value(&result)?;
            assert!(json.get("executionTime").is_some_and(|v| v.is_u64()));
        }
        Ok(())
    }
}
