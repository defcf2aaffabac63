use super::{BackendError, InteractiveShell, ShellMatch};
use async_trait::async_trait;
use regex::Regex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

/// Spawns the interactive shell used as the second transport
pub struct ShellBackend {
    /// Path to the shell binary
    binary_path: PathBuf,
    /// Arguments passed to the shell (host, port, flags)
    args: Vec<String>,
    /// Working directory for the shell
    working_dir: Option<PathBuf>,
    /// File receiving everything sent to and read from the shell
    transcript: Option<PathBuf>,
}

impl ShellBackend {
    /// Create a new shell backend with the given binary path
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            working_dir: None,
            transcript: None,
        }
    }

    /// The interactive CQL shell connected to `addr`.
    ///
    /// Output is read through pipes, so prompts and colors are forced on.
    pub fn cqlsh(binary_path: impl Into<PathBuf>, addr: SocketAddr) -> Self {
        Self::new(binary_path).with_args([
            "--color".to_string(),
            "--tty".to_string(),
            addr.ip().to_string(),
            addr.port().to_string(),
        ])
    }

    /// Ask the shell for a specific CQL version
    pub fn with_cql_version(self, version: Option<&str>) -> Self {
        match version {
            Some(version) => self.with_args([format!("--cqlversion={version}")]),
            None => self,
        }
    }

    /// Arguments the shell is started with
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Append arguments for the shell process
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the shell
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Record a transcript of the session to `path`
    pub fn with_transcript(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript = Some(path.into());
        self
    }

    /// Start the shell process
    pub fn spawn(&self) -> Result<ShellProcess, BackendError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::Spawn(format!("{}: {e}", self.binary_path.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Spawn("shell stdin not captured".to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx));
        }

        let transcript = match &self.transcript {
            Some(path) => Some(File::from_std(std::fs::File::create(path)?)),
            None => None,
        };

        tracing::debug!(binary = %self.binary_path.display(), args = ?self.args, "spawned shell");

        Ok(ShellProcess {
            _child: child,
            stdin,
            output: rx,
            pending: Vec::new(),
            buffer: String::new(),
            transcript,
        })
    }
}

/// Forward everything read from `reader` into the output channel
async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(chunk[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

/// A running shell; stdout and stderr are merged into one stream
pub struct ShellProcess {
    /// Killed when dropped
    _child: Child,
    stdin: ChildStdin,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Bytes not yet forming complete UTF-8
    pending: Vec<u8>,
    /// Decoded output not yet consumed by a match
    buffer: String,
    transcript: Option<File>,
}

impl ShellProcess {
    async fn record(&mut self, bytes: &[u8]) {
        let Some(file) = self.transcript.as_mut() else {
            return;
        };
        let written = match file.write_all(bytes).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!("failed to write shell transcript: {e}");
            self.transcript = None;
        }
    }

    async fn absorb(&mut self, chunk: &[u8]) {
        self.record(chunk).await;
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            // an invalid sequence will never complete; decode lossily
            Err(e) if e.error_len().is_some() => self.pending.len(),
            Err(e) => e.valid_up_to(),
        };
        let decoded: Vec<u8> = self.pending.drain(..valid).collect();
        self.buffer.push_str(&String::from_utf8_lossy(&decoded));
    }
}

/// Find the pattern matching earliest in `text`; ties go to the lower index.
/// Returns (pattern index, match start, match end).
pub fn earliest_match(text: &str, patterns: &[Regex]) -> Option<(usize, usize, usize)> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(index, re)| re.find(text).map(|m| (index, m.start(), m.end())))
        .min_by_key(|(index, start, _)| (*start, *index))
}

#[async_trait]
impl InteractiveShell for ShellProcess {
    async fn send_line(&mut self, line: &str) -> Result<(), BackendError> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.record(&data).await;
        self.stdin.write_all(&data).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn expect(
        &mut self,
        patterns: &[Regex],
        timeout: Duration,
    ) -> Result<ShellMatch, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((index, start, end)) = earliest_match(&self.buffer, patterns) {
                let before = self.buffer[..start].to_string();
                self.buffer.drain(..end);
                return Ok(ShellMatch { index, before });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.output.recv()).await {
                Err(_) => return Err(BackendError::Timeout(timeout)),
                Ok(None) => return Err(BackendError::Closed),
                Ok(Some(chunk)) => self.absorb(&chunk).await,
            }
        }
    }

    async fn discard_pending(&mut self) {
        while let Ok(chunk) = self.output.try_recv() {
            self.record(&chunk).await;
        }
        self.pending.clear();
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn re(s: &str) -> Regex {
        Regex::new(s).unwrap()
    }

    #[test]
    fn test_earliest_match_prefers_position() {
        let patterns = [re("cqlsh>"), re("Bad Request")];
        let found = earliest_match("Bad Request: no\ncqlsh>", &patterns);
        assert_eq!(found, Some((1, 0, 11)));
    }

    #[test]
    fn test_earliest_match_none() {
        assert_eq!(earliest_match("nothing here", &[re("cqlsh>")]), None);
    }

    #[tokio::test]
    async fn test_expect_round_trip_through_cat() {
        let mut shell = ShellBackend::new("cat").spawn().unwrap();
        shell.send_line("first line cqlsh> rest").await.unwrap();
        let m = shell
            .expect(&[re("cqlsh>")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(m.index, 0);
        assert_eq!(m.before, "first line ");

        // the remainder stays buffered for the next expect
        let m = shell
            .expect(&[re("rest")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(m.before, " ");
    }

    #[tokio::test]
    async fn test_expect_times_out() {
        let mut shell = ShellBackend::new("cat").spawn().unwrap();
        let err = shell
            .expect(&[re("never")], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_expect_reports_closed_shell() {
        let mut shell = ShellBackend::new("true").spawn().unwrap();
        let err = shell
            .expect(&[re("cqlsh>")], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Closed));
    }

    #[tokio::test]
    async fn test_transcript_records_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell_output.log");
        let mut shell = ShellBackend::new("cat")
            .with_transcript(&path)
            .spawn()
            .unwrap();
        shell.send_line("use ks; cqlsh:ks>").await.unwrap();
        shell
            .expect(&[re("cqlsh:ks>")], Duration::from_secs(5))
            .await
            .unwrap();
        drop(shell);
        let transcript = std::fs::read_to_string(&path).unwrap();
        // once as input, once echoed back by cat
        assert_eq!(transcript.matches("use ks;").count(), 2);
    }

    #[tokio::test]
    async fn test_discard_pending_drops_unread_output() {
        let mut shell = ShellBackend::new("cat").spawn().unwrap();
        shell.send_line("stale cqlsh>").await.unwrap();
        shell.send_line("fresh cqlsh>").await.unwrap();
        shell
            .expect(&[re("fresh")], Duration::from_secs(5))
            .await
            .unwrap();
        shell.discard_pending().await;

        shell.send_line("next cqlsh>").await.unwrap();
        let m = shell
            .expect(&[re("cqlsh>")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(m.before, "next ");
    }

    #[test]
    fn test_cqlsh_forces_prompt_and_colors() {
        let addr: SocketAddr = "127.0.0.2:9160".parse().unwrap();
        let backend = ShellBackend::cqlsh("/opt/db/bin/cqlsh", addr).with_cql_version(Some("2.0.0"));
        assert_eq!(
            backend.args(),
            ["--color", "--tty", "127.0.0.2", "9160", "--cqlversion=2.0.0"]
        );
        let plain = ShellBackend::cqlsh("cqlsh", addr).with_cql_version(None);
        assert_eq!(plain.args().len(), 4);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let result = ShellBackend::new("/nonexistent/cqlsh").spawn();
        assert!(matches!(result, Err(BackendError::Spawn(_))));
    }
}
