//! Runs every statement through the structured transport and, when attached,
//! the interactive shell, then reconciles what both returned.

pub mod shell_output;

use crate::backends::{
    classify, BackendError, ErrorClass, InteractiveShell, StructuredRows, StructuredSession,
};
use crate::comparison::{verify_results, ShellCell, ShellRow};
use crate::config::MAX_NAME_LEN;
use crate::error::{Error, Result};
use crate::generator::ExpectedDataset;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;

/// Prompt printed by the shell before any keyspace is selected
pub const DEFAULT_PROMPT: &str = "cqlsh>";

/// The shell works in its own keyspace so the transports never share data
pub const SHELL_KEYSPACE_PREFIX: &str = "cqlsh_";

/// Bounded retry settings for both transports
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub structured_backoff: Duration,
    pub shell_backoff: Duration,
    /// How long to wait for the shell prompt
    pub shell_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            structured_backoff: Duration::from_secs(1),
            shell_backoff: Duration::from_secs(5),
            shell_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting between attempts
    pub fn immediate() -> Self {
        Self {
            structured_backoff: Duration::ZERO,
            shell_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_shell_timeout(mut self, timeout: Duration) -> Self {
        self.shell_timeout = timeout;
        self
    }
}

/// Name of the keyspace the shell uses in place of `keyspace`
pub fn shell_keyspace_name(keyspace: &str) -> String {
    let mut name = format!("{SHELL_KEYSPACE_PREFIX}{keyspace}");
    name.truncate(MAX_NAME_LEN);
    name
}

struct ShellSide {
    shell: Box<dyn InteractiveShell>,
    prompt: String,
    timeout_banner: Regex,
    /// A statement missed its deadline; its output may still arrive
    stale: bool,
}

impl ShellSide {
    fn prompt_pattern(prompt: &str) -> Result<Regex> {
        Regex::new(&regex::escape(prompt)).map_err(|e| Error::ShellError(e.to_string()))
    }

    /// Send one line and wait for one of `patterns`
    async fn exchange(
        &mut self,
        line: &str,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<(usize, String)> {
        self.shell.send_line(line).await?;
        let found = self.shell.expect(patterns, timeout).await?;
        Ok((found.index, found.before))
    }

    async fn wait_for_prompt(&mut self, timeout: Duration) -> Result<String> {
        let prompt = Self::prompt_pattern(&self.prompt)?;
        Ok(self.shell.expect(&[prompt], timeout).await?.before)
    }

    /// Get back to a fresh prompt after a missed deadline, so late output
    /// is never read as the answer to a later statement
    async fn resync(&mut self, timeout: Duration) -> Result<()> {
        self.shell.discard_pending().await;
        self.shell.send_line("").await?;
        self.wait_for_prompt(timeout).await?;
        self.shell.discard_pending().await;
        self.stale = false;
        Ok(())
    }
}

/// A pair of sessions addressing the same cluster
pub struct DualBridge {
    structured: Box<dyn StructuredSession>,
    shell: Option<ShellSide>,
    retry: RetryPolicy,
    keyspace: Option<String>,
    created_tables: HashSet<String>,
}

impl DualBridge {
    /// Bridge over the structured transport only
    pub fn new(structured: Box<dyn StructuredSession>) -> Self {
        Self {
            structured,
            shell: None,
            retry: RetryPolicy::default(),
            keyspace: None,
            created_tables: HashSet::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Attach a freshly spawned shell, waiting for its first prompt
    pub async fn with_shell(mut self, shell: Box<dyn InteractiveShell>) -> Result<Self> {
        let timeout_banner = Regex::new(shell_output::TIMEOUT_BANNER)
            .map_err(|e| Error::ShellError(e.to_string()))?;
        let mut side = ShellSide {
            shell,
            prompt: DEFAULT_PROMPT.to_string(),
            timeout_banner,
            stale: false,
        };
        side.wait_for_prompt(self.retry.shell_timeout).await?;
        self.shell = Some(side);
        Ok(self)
    }

    pub fn has_shell(&self) -> bool {
        self.shell.is_some()
    }

    /// The keyspace the structured session is using
    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    /// The prompt the shell is expected to print next
    pub fn shell_prompt(&self) -> Option<&str> {
        self.shell.as_ref().map(|s| s.prompt.as_str())
    }

    /// Run a statement on the structured transport, retrying transient failures
    async fn run_structured(&mut self, statement: &str) -> Result<StructuredRows> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.structured.execute(statement).await {
                Ok(rows) => return Ok(rows),
                Err(e) => match classify(&e) {
                    ErrorClass::Transient if attempt < attempts => {
                        tracing::warn!(attempt, error = %e, "transient failure, retrying");
                        tokio::time::sleep(self.retry.structured_backoff).await;
                    }
                    ErrorClass::Transient => {
                        return Err(Error::TransientExhausted {
                            attempts,
                            source: e,
                        });
                    }
                    ErrorClass::Fatal => return Err(fatal(statement, e)),
                },
            }
        }
    }

    /// Run a statement in the shell, retrying when the server times out.
    /// Returns the output printed before the prompt.
    async fn run_shell(&mut self, statement: &str) -> Result<Option<String>> {
        let retry = self.retry.clone();
        let Some(side) = self.shell.as_mut() else {
            return Ok(None);
        };
        if side.stale {
            side.resync(retry.shell_timeout).await?;
        }
        let prompt = ShellSide::prompt_pattern(&side.prompt)?;
        let patterns = [prompt, side.timeout_banner.clone()];

        for attempt in 1..=retry.attempts.max(1) {
            match side.exchange(statement, &patterns, retry.shell_timeout).await {
                Ok((0, before)) => {
                    if let Some(message) = shell_output::error_banner(&before) {
                        return Err(Error::ShellError(message.to_string()));
                    }
                    return Ok(Some(before));
                }
                Ok(_) => {
                    tracing::warn!(attempt, statement, "shell request timed out");
                    side.wait_for_prompt(retry.shell_timeout).await?;
                }
                Err(Error::Transport(BackendError::Timeout(_))) => {
                    tracing::warn!(attempt, statement, "no shell prompt before the deadline");
                    side.stale = true;
                    if let Err(e) = side.resync(retry.shell_timeout).await {
                        tracing::warn!(error = %e, "shell did not return to its prompt");
                    }
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(retry.shell_backoff).await;
        }
        Err(Error::ShellTimeout {
            attempts: retry.attempts.max(1),
            statement: statement.to_string(),
        })
    }

    /// Run a statement on both transports and return the shell's output
    async fn execute_both(&mut self, statement: &str) -> Result<(StructuredRows, Option<String>)> {
        tracing::debug!(statement, "executing");
        if statement.contains('|') {
            return Err(Error::UnsupportedStatement(statement.to_string()));
        }
        let rows = self.run_structured(statement).await?;
        let shell = self.run_shell(statement).await?;
        Ok((rows, shell))
    }

    /// Run a statement on both transports
    pub async fn execute(&mut self, statement: &str) -> Result<StructuredRows> {
        Ok(self.execute_both(statement).await?.0)
    }

    /// Make sure `name` exists and select it on both transports.
    ///
    /// Returns the statements issued to create it, empty when it already
    /// existed. Losing a creation race to another client counts as success.
    pub async fn create_keyspace(&mut self, name: &str, options: &str) -> Result<Vec<String>> {
        let mut name = name.to_string();
        name.truncate(MAX_NAME_LEN);
        let use_statement = format!("USE {name}");
        let mut issued = Vec::new();

        match self.run_structured(&use_statement).await {
            Ok(_) => {}
            Err(Error::BadStatement { .. }) => {
                let create = format!("CREATE KEYSPACE {name} WITH {options}");
                match self.run_structured(&create).await {
                    Ok(_) => {}
                    Err(Error::BadStatement { source, .. }) if source.is_already_exists() => {
                        tracing::debug!(keyspace = %name, "keyspace created concurrently");
                    }
                    Err(e) => return Err(e),
                }
                self.run_structured(&use_statement).await?;
                issued.push(create);
                issued.push(use_statement);
            }
            Err(e) => return Err(e),
        }
        self.keyspace = Some(name.clone());

        self.use_shell_keyspace(&name, options).await?;
        Ok(issued)
    }

    async fn use_shell_keyspace(&mut self, keyspace: &str, options: &str) -> Result<()> {
        let timeout = self.retry.shell_timeout;
        let Some(side) = self.shell.as_mut() else {
            return Ok(());
        };
        if side.stale {
            side.resync(timeout).await?;
        }
        let shell_keyspace = shell_keyspace_name(keyspace);
        let new_prompt = format!("cqlsh:{shell_keyspace}>");
        let use_statement = format!("USE {shell_keyspace};");
        let missing = Regex::new(shell_output::MISSING_KEYSPACE)
            .map_err(|e| Error::ShellError(e.to_string()))?;
        let patterns = [ShellSide::prompt_pattern(&new_prompt)?, missing];

        let (index, _) = side.exchange(&use_statement, &patterns, timeout).await?;
        if index == 1 {
            side.wait_for_prompt(timeout).await?;
            let create = format!("CREATE KEYSPACE {shell_keyspace} WITH {options};");
            let current = [ShellSide::prompt_pattern(&side.prompt)?];
            side.exchange(&create, &current, timeout).await?;
            let selected = [ShellSide::prompt_pattern(&new_prompt)?];
            side.exchange(&use_statement, &selected, timeout).await?;
        }
        side.prompt = new_prompt;
        Ok(())
    }

    /// Create a table unless this bridge already created it in the current keyspace.
    /// Returns whether the statement was issued.
    pub async fn create_table(&mut self, statement: &str, name: &str) -> Result<bool> {
        let unique = format!("{} {name}", self.keyspace.as_deref().unwrap_or_default());
        if self.created_tables.contains(&unique) {
            return Ok(false);
        }
        self.execute(statement).await?;
        self.created_tables.insert(unique);
        Ok(true)
    }

    /// Select from a table with pre-declared columns and verify the result
    pub async fn select_static(&mut self, query: &str, expected: &ExpectedDataset) -> Result<()> {
        let (rows, output) = self.execute_both(query).await?;
        let shell = match output {
            Some(text) => shell_output::parse_static(&text)?,
            None => rows_as_shell(&rows),
        };
        verify_results(&rows, &shell, expected)
    }

    /// Select from a table with per-row column names and verify the result
    pub async fn select_dynamic(&mut self, query: &str, expected: &ExpectedDataset) -> Result<()> {
        let (rows, output) = self.execute_both(query).await?;
        let shell = match output {
            Some(text) => shell_output::parse_dynamic(&text)?,
            None => rows_as_shell(&rows),
        };
        verify_results(&rows, &shell, expected)
    }

    pub async fn close(self) -> Result<()> {
        self.structured.close().await?;
        Ok(())
    }
}

/// Map a non-retryable transport failure onto the error callers match on
fn fatal(statement: &str, error: BackendError) -> Error {
    match error {
        BackendError::Server { .. } => Error::BadStatement {
            statement: statement.to_string(),
            source: error,
        },
        other => Error::Transport(other),
    }
}

/// Render structured rows the way the shell would report them, so results can
/// still be verified when no shell is attached
fn rows_as_shell(rows: &StructuredRows) -> Vec<ShellRow> {
    rows.rows
        .iter()
        .map(|row| {
            row.iter()
                .zip(&rows.columns)
                .map(|(value, column)| ShellCell::new(column.name.clone(), value.to_string()))
                .collect::<ShellRow>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::shell_output::tests::{paint, paint_name};
    use super::*;
    use crate::backends::{error_code, ColumnSpec, CqlValue, ShellMatch};
    use crate::generator::{build, DataType, IdentifierMemo};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    type Script = Arc<Mutex<VecDeque<Result<StructuredRows, BackendError>>>>;

    /// Replays queued results and records every statement
    struct ScriptedSession {
        script: Script,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StructuredSession for ScriptedSession {
        async fn execute(&mut self, statement: &str) -> Result<StructuredRows, BackendError> {
            self.seen.lock().push(statement.to_string());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(StructuredRows::empty()))
        }

        async fn close(self: Box<Self>) -> Result<(), BackendError> {
            Ok(())
        }
    }

    /// Answers each sent line with the next queued output
    struct ScriptedShell {
        pending: String,
        replies: VecDeque<String>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl InteractiveShell for ScriptedShell {
        async fn send_line(&mut self, line: &str) -> Result<(), BackendError> {
            self.sent.lock().push(line.to_string());
            if let Some(reply) = self.replies.pop_front() {
                self.pending.push_str(&reply);
            }
            Ok(())
        }

        async fn expect(
            &mut self,
            patterns: &[Regex],
            timeout: Duration,
        ) -> Result<ShellMatch, BackendError> {
            match crate::backends::shell::earliest_match(&self.pending, patterns) {
                Some((index, start, end)) => {
                    let before = self.pending[..start].to_string();
                    self.pending.drain(..end);
                    Ok(ShellMatch { index, before })
                }
                None => Err(BackendError::Timeout(timeout)),
            }
        }

        async fn discard_pending(&mut self) {
            self.pending.clear();
        }
    }

    fn session(results: Vec<Result<StructuredRows, BackendError>>) -> (Box<ScriptedSession>, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let session = ScriptedSession {
            script: Arc::new(Mutex::new(results.into())),
            seen: seen.clone(),
        };
        (Box::new(session), seen)
    }

    fn shell(initial: &str, replies: &[&str]) -> (Box<ScriptedShell>, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let shell = ScriptedShell {
            pending: initial.to_string(),
            replies: replies.iter().map(|r| r.to_string()).collect(),
            sent: sent.clone(),
        };
        (Box::new(shell), sent)
    }

    fn server(code: i32) -> BackendError {
        BackendError::Server {
            code,
            message: "nope".into(),
        }
    }

    #[tokio::test]
    async fn test_pipe_is_rejected() {
        let (structured, seen) = session(vec![]);
        let mut bridge = DualBridge::new(structured);
        let err = bridge.execute("INSERT INTO cf (KEY) VALUES ('a|b');").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedStatement(_)));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (structured, seen) = session(vec![
            Err(server(error_code::UNAVAILABLE)),
            Err(BackendError::Timeout(Duration::from_secs(1))),
            Ok(StructuredRows::empty()),
        ]);
        let mut bridge = DualBridge::new(structured).with_retry(RetryPolicy::immediate());
        bridge.execute("SELECT 1;").await.unwrap();
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let errors = (0..5).map(|_| Err(server(error_code::OVERLOADED))).collect();
        let (structured, seen) = session(errors);
        let mut bridge = DualBridge::new(structured)
            .with_retry(RetryPolicy::immediate().with_attempts(3));
        let err = bridge.execute("SELECT 1;").await.unwrap_err();
        assert!(matches!(err, Error::TransientExhausted { attempts: 3, .. }));
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let (structured, seen) = session(vec![Err(server(error_code::SYNTAX_ERROR))]);
        let mut bridge = DualBridge::new(structured).with_retry(RetryPolicy::immediate());
        let err = bridge.execute("SELEC 1;").await.unwrap_err();
        assert!(matches!(err, Error::BadStatement { ref statement, .. } if statement == "SELEC 1;"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_create_keyspace_when_missing() {
        let (structured, seen) = session(vec![Err(server(error_code::INVALID))]);
        let mut bridge = DualBridge::new(structured).with_retry(RetryPolicy::immediate());
        let issued = bridge
            .create_keyspace("ks_abc", "strategy_class=SimpleStrategy")
            .await
            .unwrap();
        assert_eq!(
            issued,
            ["CREATE KEYSPACE ks_abc WITH strategy_class=SimpleStrategy", "USE ks_abc"]
        );
        assert_eq!(seen.lock().len(), 3);
        assert_eq!(bridge.keyspace(), Some("ks_abc"));
    }

    #[tokio::test]
    async fn test_create_keyspace_tolerates_race() {
        let (structured, _) = session(vec![
            Err(server(error_code::INVALID)),
            Err(server(error_code::ALREADY_EXISTS)),
        ]);
        let mut bridge = DualBridge::new(structured).with_retry(RetryPolicy::immediate());
        let issued = bridge.create_keyspace("ks_abc", "x=1").await.unwrap();
        assert_eq!(issued.len(), 2);
    }

    #[tokio::test]
    async fn test_existing_keyspace_issues_nothing() {
        let (structured, seen) = session(vec![]);
        let mut bridge = DualBridge::new(structured);
        assert!(bridge.create_keyspace("ks_abc", "x=1").await.unwrap().is_empty());
        assert_eq!(*seen.lock(), ["USE ks_abc"]);
    }

    #[tokio::test]
    async fn test_shell_keyspace_is_created_and_prompt_tracked() {
        let (structured, _) = session(vec![]);
        let (shell, sent) = shell(
            "Connected.\ncqlsh> ",
            &[
                "Bad Request: Keyspace 'cqlsh_ks_abc' does not exist\ncqlsh> ",
                "cqlsh> ",
                "cqlsh:cqlsh_ks_abc> ",
            ],
        );
        let mut bridge = DualBridge::new(structured)
            .with_shell(shell)
            .await
            .unwrap();
        bridge.create_keyspace("ks_abc", "x=1").await.unwrap();
        assert_eq!(bridge.shell_prompt(), Some("cqlsh:cqlsh_ks_abc>"));
        assert_eq!(
            *sent.lock(),
            [
                "USE cqlsh_ks_abc;",
                "CREATE KEYSPACE cqlsh_ks_abc WITH x=1;",
                "USE cqlsh_ks_abc;"
            ]
        );
    }

    #[tokio::test]
    async fn test_create_table_is_deduplicated() {
        let (structured, seen) = session(vec![]);
        let mut bridge = DualBridge::new(structured);
        bridge.create_keyspace("ks", "x=1").await.unwrap();
        assert!(bridge.create_table("CREATE COLUMNFAMILY cf (KEY text PRIMARY KEY);", "cf").await.unwrap());
        assert!(!bridge.create_table("CREATE COLUMNFAMILY cf (KEY text PRIMARY KEY);", "cf").await.unwrap());
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_shell_timeout_banner_is_retried() {
        let banner = "\x1b[0;1;31mRequest did not complete within rpc_timeout.\x1b[0m\ncqlsh> ";
        let (structured, _) = session(vec![]);
        let (shell, sent) = shell("cqlsh> ", &[banner, "cqlsh> "]);
        let mut bridge = DualBridge::new(structured)
            .with_retry(RetryPolicy::immediate())
            .with_shell(shell)
            .await
            .unwrap();
        bridge.execute("INSERT INTO cf (KEY) VALUES ('k');").await.unwrap();
        assert_eq!(sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_shell_gives_up_after_attempts() {
        let (structured, _) = session(vec![]);
        let (shell, _) = shell("cqlsh> ", &[]);
        let mut bridge = DualBridge::new(structured)
            .with_retry(RetryPolicy::immediate().with_attempts(2))
            .with_shell(shell)
            .await
            .unwrap();
        let err = bridge.execute("SELECT 1;").await.unwrap_err();
        assert!(matches!(err, Error::ShellTimeout { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_late_output_is_not_read_as_the_next_answer() {
        let (structured, _) = session(vec![]);
        let (shell, sent) = shell(
            "cqlsh> ",
            &["", "late rows\ncqlsh> cqlsh> ", "fresh rows\ncqlsh> "],
        );
        let mut bridge = DualBridge::new(structured)
            .with_retry(RetryPolicy::immediate().with_attempts(2))
            .with_shell(shell)
            .await
            .unwrap();
        let (_, output) = bridge.execute_both("SELECT 1;").await.unwrap();
        assert_eq!(output.as_deref(), Some("fresh rows\n"));
        assert_eq!(*sent.lock(), ["SELECT 1;", "", "SELECT 1;"]);
    }

    #[tokio::test]
    async fn test_stale_shell_resyncs_before_next_statement() {
        let (structured, _) = session(vec![]);
        let (shell, sent) = shell("cqlsh> ", &["", "", "late rows\ncqlsh> ", "ok\ncqlsh> "]);
        let mut bridge = DualBridge::new(structured)
            .with_retry(RetryPolicy::immediate().with_attempts(1))
            .with_shell(shell)
            .await
            .unwrap();
        let err = bridge.execute("SELECT 1;").await.unwrap_err();
        assert!(matches!(err, Error::ShellTimeout { attempts: 1, .. }));

        let (_, output) = bridge.execute_both("SELECT 2;").await.unwrap();
        assert_eq!(output.as_deref(), Some("ok\n"));
        assert_eq!(*sent.lock(), ["SELECT 1;", "", "", "SELECT 2;"]);
    }

    #[tokio::test]
    async fn test_select_dynamic_through_both_transports() {
        let memo = IdentifierMemo::new();
        let expected = build(DataType::Text, DataType::Text, DataType::Text, &[], false, false, &memo);
        let row = &expected.rows[0];
        let mut columns = vec![ColumnSpec { name: "KEY".into(), type_id: 0 }];
        let mut cells = vec![CqlValue::Text(row.key.to_string())];
        let mut line = format!("{},{}", paint_name("KEY"), paint(&row.key.to_string()));
        for col in row.columns() {
            columns.push(ColumnSpec { name: col.name.clone(), type_id: 0 });
            cells.push(CqlValue::Text(col.value.to_string()));
            line.push_str(&format!(" | {},{}", paint_name(&col.name), paint(&col.value.to_string())));
        }
        let single = crate::generator::ExpectedDataset { rows: vec![row.clone()] };

        let (structured, _) = session(vec![Ok(StructuredRows::new(columns, vec![cells]))]);
        let reply = format!("{line}\ncqlsh> ");
        let (shell, _) = shell("cqlsh> ", &[&reply]);
        let mut bridge = DualBridge::new(structured)
            .with_shell(shell)
            .await
            .unwrap();
        bridge
            .select_dynamic("SELECT * FROM cf WHERE KEY IN ('key_name0_0');", &single)
            .await
            .unwrap();
    }

    #[test]
    fn test_shell_keyspace_name_is_truncated() {
        let name = shell_keyspace_name("ks_0123456789abcdef0123456789abc");
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.starts_with("cqlsh_ks_"));
    }
}
