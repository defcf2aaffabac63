//! Cluster lifecycle control.

use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Port the native protocol listens on
pub const NATIVE_PORT: u16 = 9042;
/// Port of the Thrift interface, which also serves the interactive shell
pub const THRIFT_PORT: u16 = 9160;

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A node of a managed cluster
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub host: IpAddr,
    pub log_path: PathBuf,
}

impl NodeInfo {
    pub fn native_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, NATIVE_PORT)
    }

    pub fn thrift_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, THRIFT_PORT)
    }
}

/// Owns the lifecycle of the database processes
#[async_trait]
pub trait ClusterController: Send + Sync {
    /// Define a cluster of `nodes` nodes
    async fn populate(&mut self, nodes: usize) -> Result<()>;

    async fn start(&mut self) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    fn nodes(&self) -> Vec<NodeInfo>;

    /// Wait until `pattern` appears in the log of node `node`
    async fn wait_for_log(&self, node: usize, pattern: &Regex, timeout: Duration) -> Result<()>;
}

/// Drives the `ccm` command line tool
#[derive(Debug, Clone)]
pub struct CcmCluster {
    name: String,
    binary: PathBuf,
    config_dir: PathBuf,
    version: Option<String>,
    install_dir: Option<PathBuf>,
    node_count: usize,
}

impl CcmCluster {
    pub fn new(name: impl Into<String>) -> Self {
        let config_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_default()
            .join(".ccm");
        Self {
            name: name.into(),
            binary: PathBuf::from("ccm"),
            config_dir,
            version: None,
            install_dir: None,
            node_count: 0,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Directory holding ccm's cluster definitions
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    /// Database version ccm downloads
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Use a local database build instead of a download
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }

    /// Adopt an existing cluster of `nodes` nodes without creating it
    pub fn with_node_count(mut self, nodes: usize) -> Self {
        self.node_count = nodes;
        self
    }

    /// Directory of the interactive shell shipped with the cluster's build
    pub fn install_dir(&self) -> Option<&PathBuf> {
        self.install_dir.as_ref()
    }

    async fn ccm(&self, args: &[String]) -> Result<String> {
        tracing::debug!(binary = %self.binary.display(), ?args, "running ccm");
        let output = Command::new(&self.binary)
            .args(args)
            .arg("--config-dir")
            .arg(&self.config_dir)
            .output()
            .await
            .map_err(|e| Error::Cluster(format!("{}: {e}", self.binary.display())))?;
        if !output.status.success() {
            return Err(Error::Cluster(format!(
                "ccm {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ClusterController for CcmCluster {
    async fn populate(&mut self, nodes: usize) -> Result<()> {
        let mut args = vec!["create".to_string(), self.name.clone(), "-n".to_string(), nodes.to_string()];
        if let Some(version) = &self.version {
            args.extend(["-v".to_string(), version.clone()]);
        }
        if let Some(dir) = &self.install_dir {
            args.extend(["--install-dir".to_string(), dir.display().to_string()]);
        }
        self.ccm(&args).await?;
        self.node_count = nodes;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.ccm(&["start".to_string(), "--wait-for-binary-proto".to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.ccm(&["stop".to_string()]).await?;
        Ok(())
    }

    fn nodes(&self) -> Vec<NodeInfo> {
        (1..=self.node_count)
            .map(|i| {
                let name = format!("node{i}");
                let last_octet = u8::try_from(i).unwrap_or(u8::MAX);
                NodeInfo {
                    host: IpAddr::V4(Ipv4Addr::new(127, 0, 0, last_octet)),
                    log_path: self
                        .config_dir
                        .join(&self.name)
                        .join(&name)
                        .join("logs")
                        .join("system.log"),
                    name,
                }
            })
            .collect()
    }

    async fn wait_for_log(&self, node: usize, pattern: &Regex, timeout: Duration) -> Result<()> {
        let info = self
            .nodes()
            .into_iter()
            .nth(node)
            .ok_or_else(|| Error::Cluster(format!("no node with index {node}")))?;
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::fs::read(&info.log_path).await {
                Ok(bytes) if pattern.is_match(&String::from_utf8_lossy(&bytes)) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(Error::LogWaitTimeout(timeout));
            }
            tokio::time::sleep(LOG_POLL_INTERVAL).await;
        }
    }
}
