//! Node process records, spawning and output draining

use crate::error::{Result, SupervisorError};
use crate::resource::ResourceUsage;
use chrono::{DateTime, Utc};
use conclave_core::config::{NodeConfig, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Line a node prints on stdout once its control socket is listening
pub const READY_SENTINEL: &str = "READY";

/// Longest chunk of node output handled as one line; longer lines are split
const MAX_OUTPUT_LINE: usize = 16 * 1024;

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Stopped => write!(f, "stopped"),
            NodeStatus::Starting => write!(f, "starting"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Runtime record of one supervised node
#[derive(Debug)]
pub struct NodeProcess {
    pub config: NodeConfig,
    pub(crate) child: Option<Child>,
    pub pid: Option<u32>,
    pub status: NodeStatus,
    /// Automatic restarts since the last manual restart
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub(crate) attach_output: bool,
    ready: Arc<AtomicBool>,
}

impl NodeProcess {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            child: None,
            pid: None,
            status: NodeStatus::Stopped,
            restart_count: 0,
            last_error: None,
            started_at: None,
            attach_output: false,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether the node has signaled readiness since it was spawned
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    /// Install a freshly spawned process
    pub(crate) fn attach(&mut self, spawned: SpawnedNode) {
        self.pid = Some(spawned.pid);
        self.child = Some(spawned.child);
        self.ready = spawned.ready;
        self.status = NodeStatus::Running;
        self.last_error = None;
        self.started_at = Some(Utc::now());
    }

    /// Drop the process handle and return to `stopped`
    pub(crate) fn clear_process(&mut self) {
        self.child = None;
        self.pid = None;
        self.ready.store(false, Ordering::SeqCst);
        self.started_at = None;
        self.status = NodeStatus::Stopped;
    }

    /// Exit status if the process has exited, without blocking
    pub(crate) fn poll_exit(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("failed to poll process: {}", e)),
        }
    }

    /// Snapshot for status reporting
    pub fn info(&self, usage: Option<ResourceUsage>) -> NodeStatusInfo {
        NodeStatusInfo {
            status: self.status,
            pid: self.pid,
            port: self.config.port,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            is_ready: self.is_ready(),
            started_at: self.started_at,
            cpu_percent: usage.map(|u| u.cpu_percent),
            memory_mb: usage.map(|u| u.memory_mb),
        }
    }
}

/// Status snapshot of one node as returned by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusInfo {
    pub status: NodeStatus,
    pub pid: Option<u32>,
    pub port: u16,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub is_ready: bool,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
}

pub(crate) struct SpawnedNode {
    pub(crate) child: Child,
    pub(crate) pid: u32,
    pub(crate) ready: Arc<AtomicBool>,
}

/// Spawn the node entry point and start draining its output.
///
/// Invocation: `<node_command> <node_args...> --config <json> --available-nodes <a,b>
/// --socket-dir <dir>`. The child gets its own process group so signals reach
/// anything it forks.
pub(crate) fn spawn_node(
    settings: &SupervisorConfig,
    node: &NodeConfig,
    known_nodes: &[String],
    attach_output: bool,
) -> Result<SpawnedNode> {
    let spawn_error = |message: String| SupervisorError::Spawn {
        node: node.name.clone(),
        message,
    };

    let config_json = serde_json::to_string(node).map_err(|e| spawn_error(e.to_string()))?;

    let mut command = Command::new(&settings.node_command);
    command
        .args(&settings.node_args)
        .arg("--config")
        .arg(config_json)
        .arg("--available-nodes")
        .arg(known_nodes.join(","))
        .arg("--socket-dir")
        .arg(&settings.socket_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|e| {
        spawn_error(format!(
            "{}: {}",
            settings.node_command.display(),
            e
        ))
    })?;
    let pid = child
        .id()
        .ok_or_else(|| spawn_error("process exited before reporting a pid".to_string()))?;

    let ready = Arc::new(AtomicBool::new(false));
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_output(
            node.name.clone(),
            "stdout",
            stdout,
            Some(ready.clone()),
            attach_output,
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_output(
            node.name.clone(),
            "stderr",
            stderr,
            None,
            attach_output,
        ));
    }

    info!("Spawned node {} (PID: {})", node.name, pid);
    Ok(SpawnedNode { child, pid, ready })
}

/// Read a child stream to EOF so the pipe never fills, flipping `ready` on the sentinel
async fn drain_output<R>(
    node: String,
    stream: &'static str,
    reader: R,
    ready: Option<Arc<AtomicBool>>,
    attach_output: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match (&mut reader)
            .take(MAX_OUTPUT_LINE as u64)
            .read_until(b'\n', &mut buf)
            .await
        {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();

                if let Some(flag) = &ready {
                    if line.trim() == READY_SENTINEL {
                        flag.store(true, Ordering::SeqCst);
                        info!("Node {} signaled ready", node);
                        continue;
                    }
                }

                if attach_output {
                    info!(node = %node, stream, "{}", line);
                } else {
                    debug!(node = %node, stream, "{}", line);
                }
            }
            Err(e) => {
                warn!("Failed reading {} of node {}: {}", stream, node, e);
                break;
            }
        }
    }

    debug!("Node {} closed {}", node, stream);
}

/// Deliver `signal` to the node's process group; `false` if nothing was signaled
#[cfg(unix)]
pub(crate) fn signal_group(node: &str, pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };

    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => {
            debug!("Sent {} to node {} (PID: {})", signal, node, pid);
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Failed to send {} to node {}: {}", signal, node, e);
            false
        }
    }
}
