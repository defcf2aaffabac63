//! Schema churn: many clients create and drop tables at once, after which
//! every node must agree on how many tables the keyspace holds.

use crate::backends::{SessionFactory, StructuredRows};
use crate::error::{Error, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Churn scenario settings
#[derive(Debug, Clone)]
pub struct ChurnConfig {
    pub keyspace: String,
    /// Concurrent actors, one table each
    pub tables: usize,
    pub cycles: usize,
    pub replication_factor: usize,
    /// Pause between joining the actors and counting tables
    pub settle: Duration,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            keyspace: "ks".to_string(),
            tables: 6,
            cycles: 5,
            replication_factor: 3,
            settle: Duration::from_secs(1),
        }
    }
}

impl ChurnConfig {
    pub fn with_tables(mut self, tables: usize) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn with_replication_factor(mut self, rf: usize) -> Self {
        self.replication_factor = rf;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChurnPhase {
    Create,
    Drop,
}

impl ChurnPhase {
    fn statement(self, table: usize) -> String {
        match self {
            ChurnPhase::Create => format!(
                "CREATE TABLE test{table} (row text, val1 int, val2 varchar, PRIMARY KEY (row));"
            ),
            ChurnPhase::Drop => format!("DROP TABLE test{table};"),
        }
    }
}

/// An actor whose statement failed
#[derive(Debug, Clone)]
pub struct ActorFailure {
    pub cycle: usize,
    pub actor: usize,
    pub phase: ChurnPhase,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ChurnReport {
    pub cycles_completed: usize,
    pub failures: Vec<ActorFailure>,
}

/// Open a session on `node` and run `statements` in order
async fn run_on(
    factory: &dyn SessionFactory,
    node: usize,
    statements: &[String],
) -> Result<StructuredRows> {
    let mut session = factory.connect(node).await?;
    let mut last = StructuredRows::empty();
    for statement in statements {
        last = session.execute(statement).await?;
    }
    session.close().await?;
    Ok(last)
}

async fn count_tables(factory: &dyn SessionFactory, node: usize, keyspace: &str) -> Result<usize> {
    let query = format!(
        "SELECT * FROM system.schema_columnfamilies WHERE keyspace_name='{keyspace}'"
    );
    Ok(run_on(factory, node, &[query]).await?.rows.len())
}

/// Run every actor of one phase concurrently and join them all
async fn run_phase(
    factory: &Arc<dyn SessionFactory>,
    config: &ChurnConfig,
    cycle: usize,
    phase: ChurnPhase,
    report: &mut ChurnReport,
) {
    let mut actors = FuturesUnordered::new();
    for actor in 0..config.tables {
        let factory = factory.clone();
        let statements = vec![format!("USE {};", config.keyspace), phase.statement(actor)];
        actors.push(async move {
            let result = run_on(factory.as_ref(), 0, &statements).await;
            (actor, result)
        });
    }

    while let Some((actor, result)) = actors.next().await {
        if let Err(e) = result {
            tracing::warn!(cycle, actor, ?phase, error = %e, "actor failed");
            report.failures.push(ActorFailure {
                cycle,
                actor,
                phase,
                error: e.to_string(),
            });
        }
    }
}

/// Require every node to report `expected` tables
async fn check_agreement(factory: &dyn SessionFactory, keyspace: &str, expected: usize) -> Result<()> {
    for node in 0..factory.node_count() {
        let actual = count_tables(factory, node, keyspace).await?;
        tracing::debug!(node, actual, "tables counted");
        if actual != expected {
            return Err(Error::SchemaDisagreement {
                node,
                actual,
                expected,
            });
        }
    }
    Ok(())
}

/// Run the churn scenario. Actor failures are collected in the report;
/// disagreement between nodes ends the run with an error.
pub async fn run_churn(factory: Arc<dyn SessionFactory>, config: &ChurnConfig) -> Result<ChurnReport> {
    let create_keyspace = format!(
        "CREATE KEYSPACE {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        config.keyspace, config.replication_factor
    );
    match run_on(factory.as_ref(), 0, &[create_keyspace]).await {
        Ok(_) => {}
        Err(Error::Transport(e)) if e.is_already_exists() => {
            tracing::debug!(keyspace = %config.keyspace, "keyspace already exists");
        }
        Err(e) => return Err(e),
    }

    let mut report = ChurnReport::default();
    for cycle in 0..config.cycles {
        tracing::info!(cycle, tables = config.tables, "starting churn cycle");

        run_phase(&factory, config, cycle, ChurnPhase::Create, &mut report).await;
        tokio::time::sleep(config.settle).await;
        check_agreement(factory.as_ref(), &config.keyspace, config.tables).await?;

        run_phase(&factory, config, cycle, ChurnPhase::Drop, &mut report).await;
        tokio::time::sleep(config.settle).await;
        check_agreement(factory.as_ref(), &config.keyspace, 0).await?;

        report.cycles_completed += 1;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{error_code, BackendError, ColumnSpec, CqlValue, StructuredSession};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;

    /// A cluster whose nodes share one schema
    #[derive(Default)]
    struct FakeSchema {
        keyspaces: BTreeSet<String>,
        tables: BTreeSet<String>,
        /// Statements that fail once with a server error
        poisoned: Vec<String>,
        /// Node that always reports one table too many
        lagging_node: Option<usize>,
    }

    struct FakeFactory {
        nodes: usize,
        schema: Arc<Mutex<FakeSchema>>,
    }

    struct FakeSession {
        node: usize,
        schema: Arc<Mutex<FakeSchema>>,
    }

    #[async_trait]
    impl StructuredSession for FakeSession {
        async fn execute(&mut self, statement: &str) -> Result<StructuredRows, BackendError> {
            let mut schema = self.schema.lock();
            if let Some(pos) = schema.poisoned.iter().position(|s| s == statement) {
                schema.poisoned.remove(pos);
                return Err(BackendError::Server {
                    code: error_code::SERVER_ERROR,
                    message: "schema change failed".into(),
                });
            }
            let words: Vec<&str> = statement.trim_end_matches(';').split_whitespace().collect();
            match words.as_slice() {
                ["CREATE", "KEYSPACE", name, ..] => {
                    if !schema.keyspaces.insert(name.to_string()) {
                        return Err(BackendError::Server {
                            code: error_code::ALREADY_EXISTS,
                            message: "exists".into(),
                        });
                    }
                }
                ["CREATE", "TABLE", name, ..] => {
                    schema.tables.insert(name.to_string());
                }
                ["DROP", "TABLE", name] => {
                    schema.tables.remove(*name);
                }
                ["SELECT", ..] => {
                    let extra = usize::from(schema.lagging_node == Some(self.node));
                    let rows = (0..schema.tables.len() + extra)
                        .map(|i| vec![CqlValue::Text(format!("t{i}"))])
                        .collect();
                    let columns = vec![ColumnSpec {
                        name: "columnfamily_name".into(),
                        type_id: 0,
                    }];
                    return Ok(StructuredRows::new(columns, rows));
                }
                _ => {}
            }
            Ok(StructuredRows::empty())
        }

        async fn close(self: Box<Self>) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        fn node_count(&self) -> usize {
            self.nodes
        }

        async fn connect(&self, node: usize) -> Result<Box<dyn StructuredSession>, BackendError> {
            Ok(Box::new(FakeSession {
                node,
                schema: self.schema.clone(),
            }))
        }
    }

    fn factory(schema: FakeSchema) -> (Arc<dyn SessionFactory>, Arc<Mutex<FakeSchema>>) {
        let schema = Arc::new(Mutex::new(schema));
        let factory = FakeFactory {
            nodes: 3,
            schema: schema.clone(),
        };
        (Arc::new(factory), schema)
    }

    fn quick() -> ChurnConfig {
        ChurnConfig::default()
            .with_cycles(2)
            .with_tables(4)
            .with_settle(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_churn_cycles_complete() {
        let (factory, schema) = factory(FakeSchema::default());
        let report = run_churn(factory, &quick()).await.unwrap();
        assert_eq!(report.cycles_completed, 2);
        assert!(report.failures.is_empty());
        assert!(schema.lock().tables.is_empty());
        assert!(schema.lock().keyspaces.contains("ks"));
    }

    #[tokio::test]
    async fn test_existing_keyspace_is_reused() {
        let mut schema = FakeSchema::default();
        schema.keyspaces.insert("ks".into());
        let (factory, _) = factory(schema);
        run_churn(factory, &quick()).await.unwrap();
    }

    #[tokio::test]
    async fn test_disagreement_is_reported() {
        let schema = FakeSchema {
            lagging_node: Some(2),
            ..FakeSchema::default()
        };
        let (factory, _) = factory(schema);
        let err = run_churn(factory, &quick()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::SchemaDisagreement {
                node: 2,
                actual: 5,
                expected: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_actor_failures_are_collected() {
        let schema = FakeSchema {
            // test1 is never created, so the counts disagree with the plan
            poisoned: vec![ChurnPhase::Create.statement(1)],
            ..FakeSchema::default()
        };
        let (factory, _) = factory(schema);
        let config = quick();
        let mut report = ChurnReport::default();
        run_phase(&factory, &config, 0, ChurnPhase::Create, &mut report).await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].actor, 1);
        assert_eq!(report.failures[0].phase, ChurnPhase::Create);

        let err = check_agreement(factory.as_ref(), &config.keyspace, config.tables)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemaDisagreement { actual: 3, .. }));
    }
}
