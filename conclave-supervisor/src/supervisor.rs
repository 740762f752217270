//! Fleet supervisor
//!
//! Owns the node table and every lifecycle transition. The health monitor and
//! crash watch reach node state only through the methods here, and every
//! start/stop/restart of a node runs under that node's operation lock.

use crate::client::SocketClient;
use crate::connection::{ConnectionManager, Edge};
use crate::error::{Result, SupervisorError};
use crate::health::{HealthMonitor, HealthState, HealthStatus};
use crate::process::{NodeProcess, NodeStatus, NodeStatusInfo, spawn_node};
use crate::resource::ResourceSampler;
use conclave_core::config::{
    ConclaveConfig, HealthConfig, NodeConfig, RecoveryMode, SupervisorConfig,
};
use conclave_core::control::{AddressResolver, SocketDir};
use conclave_core::metrics::{FleetMetrics, MetricsCollector};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stop timeout used when recovery restarts a node
pub const RECOVERY_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between stop and start on a manual restart
const RESTART_PAUSE: Duration = Duration::from_millis(500);

/// Interval between readiness checks in `start_all`
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout of the health probe used while waiting for readiness
const READY_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Background recovery task installed by `start_monitoring`
pub(crate) struct MonitorHandle {
    mode: &'static str,
    token: CancellationToken,
    task: JoinHandle<()>,
    health: Option<(Arc<HealthState>, HealthConfig)>,
}

impl MonitorHandle {
    pub(crate) fn new(
        mode: &'static str,
        token: CancellationToken,
        task: JoinHandle<()>,
        health: Option<(Arc<HealthState>, HealthConfig)>,
    ) -> Self {
        Self {
            mode,
            token,
            task,
            health,
        }
    }
}

struct SupervisorInner {
    settings: SupervisorConfig,
    nodes: RwLock<BTreeMap<String, NodeProcess>>,
    op_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    client: SocketClient,
    connections: ConnectionManager,
    metrics: FleetMetrics,
    sampler: ResourceSampler,
    monitor: Mutex<Option<MonitorHandle>>,
    ready_cancel: std::sync::Mutex<CancellationToken>,
}

/// Supervises a fleet of node processes.
///
/// Cheap to clone; clones share the same fleet.
#[derive(Clone)]
pub struct NodeSupervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for NodeSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSupervisor")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

/// Non-owning handle used by background loops
#[derive(Clone)]
pub(crate) struct WeakSupervisor(Weak<SupervisorInner>);

impl WeakSupervisor {
    pub(crate) fn upgrade(&self) -> Option<NodeSupervisor> {
        self.0.upgrade().map(|inner| NodeSupervisor { inner })
    }
}

impl NodeSupervisor {
    /// Create a supervisor whose control sockets live in `settings.socket_dir`
    pub async fn new(settings: SupervisorConfig) -> Result<Self> {
        let resolver = Arc::new(SocketDir::new(settings.socket_dir.clone()));
        Self::with_resolver(settings, resolver).await
    }

    /// Create a supervisor with a custom socket resolver.
    ///
    /// Nodes are still told `settings.socket_dir`; the resolver must agree with
    /// where they bind.
    pub async fn with_resolver(
        settings: SupervisorConfig,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self> {
        let client = SocketClient::new(resolver, settings.socket_timeout);
        let metrics = FleetMetrics::new(Arc::new(MetricsCollector::new())).await?;

        Ok(Self {
            inner: Arc::new(SupervisorInner {
                settings,
                nodes: RwLock::new(BTreeMap::new()),
                op_locks: std::sync::Mutex::new(HashMap::new()),
                connections: ConnectionManager::new(client.clone()),
                client,
                metrics,
                sampler: ResourceSampler::new(),
                monitor: Mutex::new(None),
                ready_cancel: std::sync::Mutex::new(CancellationToken::new()),
            }),
        })
    }

    /// Create a supervisor and register every node of `config`
    pub async fn from_config(config: &ConclaveConfig) -> Result<Self> {
        config.validate()?;
        let supervisor = Self::new(config.supervisor.clone()).await?;
        for node in &config.nodes {
            supervisor.add_node(node.clone()).await?;
        }
        Ok(supervisor)
    }

    pub(crate) fn downgrade(&self) -> WeakSupervisor {
        WeakSupervisor(Arc::downgrade(&self.inner))
    }

    pub fn settings(&self) -> &SupervisorConfig {
        &self.inner.settings
    }

    pub fn client(&self) -> &SocketClient {
        &self.inner.client
    }

    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    /// Fleet-level metrics
    pub fn metrics(&self) -> &FleetMetrics {
        &self.inner.metrics
    }

    /// Register a node. A duplicate name is ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub async fn add_node(&self, config: NodeConfig) -> Result<()> {
        config.validate()?;

        let mut nodes = self.inner.nodes.write().await;
        if nodes.contains_key(&config.name) {
            warn!("Node {} already registered, ignoring", config.name);
            return Ok(());
        }

        info!("Registered node {} (port: {})", config.name, config.port);
        nodes.insert(config.name.clone(), NodeProcess::new(config));
        Ok(())
    }

    /// Stop a node if needed and forget it
    pub async fn remove_node(&self, name: &str) -> Result<()> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        self.stop_node_locked(name, self.inner.settings.stop_timeout)
            .await?;
        self.inner.nodes.write().await.remove(name);
        self.inner.connections.unregister_node(name).await;
        if let Some(health) = self.health_state().await {
            health.forget(name).await;
        }
        if let Ok(mut locks) = self.inner.op_locks.lock() {
            locks.remove(name);
        }

        info!("Removed node {}", name);
        Ok(())
    }

    /// Registered node names in sorted order
    pub async fn node_names(&self) -> Vec<String> {
        self.inner.nodes.read().await.keys().cloned().collect()
    }

    /// Spawn a node. Starting a running node is a no-op.
    ///
    /// With `attach_output` the node's stdout and stderr are logged at info level;
    /// otherwise at debug. Both are always drained.
    ///
    /// # Errors
    ///
    /// `NodeNotFound` for an unknown name; `Spawn` if the process could not be
    /// created, in which case the node is marked failed.
    pub async fn start_node(&self, name: &str, attach_output: bool) -> Result<()> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.start_node_locked(name, attach_output).await
    }

    async fn start_node_locked(&self, name: &str, attach_output: bool) -> Result<()> {
        let (config, known) = {
            let mut nodes = self.inner.nodes.write().await;
            let known: Vec<String> = nodes.keys().cloned().collect();
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NodeNotFound(name.to_string()))?;

            if node.status == NodeStatus::Running && node.child.is_some() {
                debug!("Node {} is already running", name);
                return Ok(());
            }

            info!("Starting node {}", name);
            node.status = NodeStatus::Starting;
            node.attach_output = attach_output;
            (node.config.clone(), known)
        };

        self.inner
            .connections
            .register_node(&config.name, config.port)
            .await;

        let spawned = spawn_node(&self.inner.settings, &config, &known, attach_output);

        let mut nodes = self.inner.nodes.write().await;
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NodeNotFound(name.to_string()))?;

        match spawned {
            Ok(spawned) => {
                node.attach(spawned);
                drop(nodes);
                self.record_metric(self.inner.metrics.set_node_up(name, true))
                    .await;
                self.record_metric(self.inner.metrics.set_node_start_time(name))
                    .await;
                Ok(())
            }
            Err(e) => {
                error!("Failed to start node {}: {}", name, e);
                node.status = NodeStatus::Failed;
                node.last_error = Some(e.to_string());
                drop(nodes);
                self.record_metric(self.inner.metrics.set_node_up(name, false))
                    .await;
                Err(e)
            }
        }
    }

    /// Stop a node: `shutdown` command, then SIGTERM, then SIGKILL.
    ///
    /// Always leaves the node `stopped` with no pid and not ready.
    pub async fn stop_node(&self, name: &str, timeout: Duration) -> Result<()> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        self.stop_node_locked(name, timeout).await
    }

    async fn stop_node_locked(&self, name: &str, timeout: Duration) -> Result<()> {
        let (child, pid) = {
            let mut nodes = self.inner.nodes.write().await;
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NodeNotFound(name.to_string()))?;
            (node.child.take(), node.pid)
        };

        if let Some(mut child) = child {
            info!("Stopping node {}", name);
            self.terminate(name, &mut child, pid, timeout).await;
        }

        if let Some(node) = self.inner.nodes.write().await.get_mut(name) {
            node.clear_process();
        }
        self.record_metric(self.inner.metrics.set_node_up(name, false))
            .await;
        Ok(())
    }

    async fn terminate(&self, name: &str, child: &mut Child, pid: Option<u32>, timeout: Duration) {
        let client = self
            .inner
            .client
            .with_timeout(self.inner.client.timeout().min(timeout));
        let started = Instant::now();
        match client.shutdown(name).await {
            Ok(()) => debug!("Node {} acknowledged shutdown", name),
            Err(e) => debug!("Graceful shutdown of node {} failed: {}", name, e),
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        if wait_exit(child, remaining).await {
            info!("Node {} stopped gracefully", name);
            return;
        }

        warn!("Node {} did not exit within {:?}, sending SIGTERM", name, timeout);
        #[cfg(unix)]
        {
            if let Some(pid) = pid {
                crate::process::signal_group(name, pid, nix::sys::signal::Signal::SIGTERM);
            }
        }
        if wait_exit(child, self.inner.settings.terminate_grace).await {
            info!("Node {} terminated", name);
            return;
        }

        warn!("Node {} ignored SIGTERM, killing", name);
        #[cfg(unix)]
        {
            if let Some(pid) = pid {
                crate::process::signal_group(name, pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
        if let Err(e) = child.start_kill() {
            debug!("Kill of node {} failed: {}", name, e);
        }
        if !wait_exit(child, self.inner.settings.terminate_grace).await {
            error!("Node {} did not exit after SIGKILL", name);
        }
    }

    /// Manual restart: stop, reset `restart_count` and the restart budget, start
    pub async fn restart_node(&self, name: &str) -> Result<()> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        info!("Restarting node {}", name);
        self.stop_node_locked(name, self.inner.settings.stop_timeout)
            .await?;
        tokio::time::sleep(RESTART_PAUSE).await;

        let attach_output = {
            let mut nodes = self.inner.nodes.write().await;
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NodeNotFound(name.to_string()))?;
            node.restart_count = 0;
            node.last_error = None;
            node.attach_output
        };
        if let Some(health) = self.health_state().await {
            health.forget(name).await;
        }

        self.start_node_locked(name, attach_output).await
    }

    /// Spawn every node with a stagger, then optionally wait until all are ready.
    ///
    /// # Errors
    ///
    /// The first spawn failure; `ReadyTimeout` naming the nodes that never became
    /// ready; `Cancelled` if `stop_all` ran during the wait.
    pub async fn start_all(&self, wait_for_ready: bool) -> Result<()> {
        let names = self.node_names().await;
        info!("Starting {} nodes", names.len());

        let mut first_error = None;
        for (index, name) in names.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.inner.settings.spawn_stagger).await;
            }
            if let Err(e) = self.start_node(name, true).await {
                first_error.get_or_insert(e);
            }
        }

        if wait_for_ready {
            self.wait_for_ready(self.inner.settings.ready_timeout)
                .await?;
            info!("All running nodes are ready");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait until every running node is ready.
    ///
    /// A node counts as ready once it printed `READY` or answers `health`.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let cancel = self.ready_token();
        let deadline = Instant::now() + timeout;
        let probe = self.inner.client.with_timeout(READY_PROBE_TIMEOUT);

        loop {
            let pending = self.unready_nodes().await;
            if pending.is_empty() {
                return Ok(());
            }

            let results = join_all(pending.iter().map(|name| probe.health_check(name))).await;
            let mut still_pending = Vec::new();
            for (name, result) in pending.into_iter().zip(results) {
                if result.is_ok() {
                    self.mark_ready(&name).await;
                } else {
                    still_pending.push(name);
                }
            }
            if still_pending.is_empty() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                error!("Nodes not ready after {:?}: {}", timeout, still_pending.join(", "));
                return Err(SupervisorError::ReadyTimeout {
                    timeout,
                    nodes: still_pending,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SupervisorError::Cancelled),
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    async fn unready_nodes(&self) -> Vec<String> {
        self.inner
            .nodes
            .read()
            .await
            .iter()
            .filter(|(_, node)| node.status == NodeStatus::Running && !node.is_ready())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn ready_token(&self) -> CancellationToken {
        match self.inner.ready_cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stop the recovery monitor, cancel readiness waits and stop every node concurrently
    pub async fn stop_all(&self) {
        info!("Stopping all nodes");
        self.stop_monitoring().await;

        {
            let mut token = match self.inner.ready_cancel.lock() {
                Ok(token) => token,
                Err(poisoned) => poisoned.into_inner(),
            };
            token.cancel();
            *token = CancellationToken::new();
        }

        let names = self.node_names().await;
        let timeout = self.inner.settings.stop_timeout;
        let results = join_all(names.iter().map(|name| self.stop_node(name, timeout))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                error!("Failed to stop node {}: {}", name, e);
            }
        }
        info!("All nodes stopped");
    }

    /// Wire `from` to `to`, and `to` to `from` when `bidirectional`.
    ///
    /// Each direction is attempted independently; the first error is returned.
    ///
    /// # Errors
    ///
    /// `NodeNotFound` or `NodeNotRunning` unless both nodes are running;
    /// `ConnectFailed` if a node rejects or does not answer the command.
    pub async fn connect(&self, from: &str, to: &str, bidirectional: bool) -> Result<()> {
        self.ensure_running(from).await?;
        self.ensure_running(to).await?;

        let forward = self.connect_edge(from, to).await;
        if bidirectional {
            let reverse = self.connect_edge(to, from).await;
            forward.and(reverse)
        } else {
            forward
        }
    }

    async fn connect_edge(&self, from: &str, to: &str) -> Result<()> {
        let result = self.inner.connections.connect(from, to).await;
        let metrics = &self.inner.metrics;
        match &result {
            Ok(()) => self.record_metric(metrics.inc_connections(from, to)).await,
            Err(_) => {
                self.record_metric(metrics.inc_connection_errors(from, to))
                    .await
            }
        }
        result
    }

    async fn ensure_running(&self, name: &str) -> Result<()> {
        let nodes = self.inner.nodes.read().await;
        match nodes.get(name) {
            None => Err(SupervisorError::NodeNotFound(name.to_string())),
            Some(node) if node.status != NodeStatus::Running => {
                Err(SupervisorError::NodeNotRunning(name.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Established topology edges
    pub async fn connections(&self) -> Vec<Edge> {
        self.inner.connections.connections().await
    }

    /// Status snapshot of every node, with resource usage for running ones
    pub async fn get_status(&self) -> BTreeMap<String, NodeStatusInfo> {
        let nodes = self.inner.nodes.read().await;
        nodes
            .iter()
            .map(|(name, node)| {
                let usage = match (node.status, node.pid) {
                    (NodeStatus::Running, Some(pid)) => self.inner.sampler.sample(pid),
                    _ => None,
                };
                (name.clone(), node.info(usage))
            })
            .collect()
    }

    /// Status snapshot of one node
    pub async fn node_status(&self, name: &str) -> Option<NodeStatusInfo> {
        self.inner.nodes.read().await.get(name).map(|node| {
            let usage = node.pid.and_then(|pid| self.inner.sampler.sample(pid));
            node.info(usage)
        })
    }

    /// Health records kept by the health monitor; empty when it is not active
    pub async fn get_health_status(&self) -> BTreeMap<String, HealthStatus> {
        match self.health_state().await {
            Some(health) => health.snapshot().await,
            None => BTreeMap::new(),
        }
    }

    /// Install `mode` as the only recovery mechanism, replacing any previous one
    pub async fn start_monitoring(&self, mode: RecoveryMode) {
        self.stop_monitoring().await;

        let handle = match mode {
            RecoveryMode::None => {
                info!("Automatic recovery disabled");
                return;
            }
            RecoveryMode::CrashWatch {
                interval,
                max_restarts,
            } => self.spawn_crash_watch(interval, max_restarts),
            RecoveryMode::HealthMonitor(config) => HealthMonitor::spawn(self, config),
        };

        *self.inner.monitor.lock().await = Some(handle);
    }

    /// Stop the active recovery mechanism, if any
    pub async fn stop_monitoring(&self) {
        let handle = self.inner.monitor.lock().await.take();
        if let Some(handle) = handle {
            debug!("Stopping {}", handle.mode);
            handle.token.cancel();
            if let Err(e) = handle.task.await {
                warn!("{} task ended abnormally: {}", handle.mode, e);
            }
        }
    }

    /// Name of the active recovery mechanism
    pub async fn monitoring_mode(&self) -> Option<&'static str> {
        self.inner
            .monitor
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.mode)
    }

    /// Run one pass of the installed health monitor and wait for any recovery it starts.
    ///
    /// Shares health records and restart budgets with the background loop.
    /// Returns `false` when no health monitor is installed.
    pub async fn check_health(&self) -> bool {
        let installed = self
            .inner
            .monitor
            .lock()
            .await
            .as_ref()
            .and_then(|handle| handle.health.clone());
        match installed {
            Some((state, config)) => {
                HealthMonitor::with_state(self.clone(), config, state)
                    .check_all()
                    .await;
                true
            }
            None => false,
        }
    }

    async fn health_state(&self) -> Option<Arc<HealthState>> {
        self.inner
            .monitor
            .lock()
            .await
            .as_ref()
            .and_then(|handle| handle.health.as_ref().map(|(state, _)| state.clone()))
    }

    fn spawn_crash_watch(&self, interval: Duration, max_restarts: u32) -> MonitorHandle {
        let token = CancellationToken::new();
        let weak = self.downgrade();

        let task = tokio::spawn({
            let token = token.clone();
            async move {
                info!(
                    "Crash watch started (interval: {:?}, max restarts: {})",
                    interval, max_restarts
                );
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let Some(supervisor) = weak.upgrade() else {
                        break;
                    };
                    // Runs to completion so a restart is never cut off halfway
                    supervisor.check_crashes(max_restarts).await;
                }
                info!("Crash watch stopped");
            }
        });

        MonitorHandle::new("crash_watch", token, task, None)
    }

    /// One crash-watch pass: restart nodes whose process exited, up to `max_restarts`
    pub async fn check_crashes(&self, max_restarts: u32) {
        for name in self.supervised_nodes().await {
            let Some(Some(exit)) = self.poll_process(&name).await else {
                continue;
            };

            let restart_count = {
                let mut nodes = self.inner.nodes.write().await;
                let Some(node) = nodes.get_mut(&name) else {
                    continue;
                };
                node.status = NodeStatus::Failed;
                node.last_error = Some(format!("Process exited unexpectedly: {}", exit));
                node.restart_count
            };
            error!("Node {} exited unexpectedly: {}", name, exit);
            self.record_metric(self.inner.metrics.set_node_up(&name, false))
                .await;

            if restart_count >= max_restarts {
                warn!(
                    "Node {} reached its crash restart cap ({}), leaving it failed",
                    name, max_restarts
                );
                self.release_crashed(&name).await;
                continue;
            }

            if let Err(e) = self.restart_crashed(&name).await {
                error!("Failed to restart crashed node {}: {}", name, e);
            }
        }
    }

    async fn release_crashed(&self, name: &str) {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;
        if let Some(node) = self.inner.nodes.write().await.get_mut(name) {
            if node.status == NodeStatus::Failed {
                node.clear_process();
                node.status = NodeStatus::Failed;
            }
        }
    }

    async fn restart_crashed(&self, name: &str) -> Result<()> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        let attach_output = {
            let mut nodes = self.inner.nodes.write().await;
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NodeNotFound(name.to_string()))?;
            // Someone else already handled it
            if node.status != NodeStatus::Failed {
                return Ok(());
            }
            node.restart_count += 1;
            node.clear_process();
            node.attach_output
        };

        info!("Restarting crashed node {}", name);
        self.start_node_locked(name, attach_output).await?;
        self.record_metric(self.inner.metrics.inc_restarts(name, "crash"))
            .await;
        Ok(())
    }

    /// Automatic restart used by the health monitor.
    ///
    /// Returns `false` without doing anything if the node is no longer running.
    pub(crate) async fn recover_node(&self, name: &str, delay: Duration) -> Result<bool> {
        let lock = self.op_lock(name);
        let _guard = lock.lock().await;

        {
            let nodes = self.inner.nodes.read().await;
            let node = nodes
                .get(name)
                .ok_or_else(|| SupervisorError::NodeNotFound(name.to_string()))?;
            if node.status != NodeStatus::Running {
                return Ok(false);
            }
        }

        self.stop_node_locked(name, RECOVERY_STOP_TIMEOUT).await?;
        tokio::time::sleep(delay).await;

        let attach_output = {
            let mut nodes = self.inner.nodes.write().await;
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NodeNotFound(name.to_string()))?;
            node.restart_count += 1;
            node.attach_output
        };

        self.start_node_locked(name, attach_output).await?;
        Ok(true)
    }

    /// Names of running nodes that still own a process handle
    pub(crate) async fn supervised_nodes(&self) -> Vec<String> {
        self.inner
            .nodes
            .read()
            .await
            .iter()
            .filter(|(_, node)| node.status == NodeStatus::Running && node.child.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// `None` if the node is not supervised, `Some(Some(exit))` if its process exited
    pub(crate) async fn poll_process(&self, name: &str) -> Option<Option<String>> {
        let mut nodes = self.inner.nodes.write().await;
        let node = nodes.get_mut(name)?;
        if node.status != NodeStatus::Running || node.child.is_none() {
            return None;
        }
        let exit = node.poll_exit();
        if let Some(exit) = &exit {
            node.last_error = Some(format!("Process exited: {}", exit));
        }
        Some(exit)
    }

    pub(crate) async fn set_last_error(&self, name: &str, message: String) {
        if let Some(node) = self.inner.nodes.write().await.get_mut(name) {
            node.last_error = Some(message);
        }
    }

    pub(crate) async fn mark_ready(&self, name: &str) {
        if let Some(node) = self.inner.nodes.read().await.get(name) {
            node.mark_ready();
        }
    }

    pub(crate) async fn clear_ready(&self, name: &str) {
        if let Some(node) = self.inner.nodes.read().await.get(name) {
            node.clear_ready();
        }
    }

    pub(crate) async fn record_metric<F>(&self, recording: F)
    where
        F: Future<Output = conclave_core::error::Result<()>>,
    {
        if let Err(e) = recording.await {
            warn!("Failed to record fleet metric: {}", e);
        }
    }

    fn op_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.inner.op_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

async fn wait_exit(child: &mut Child, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Waiting for process failed: {}", e);
            true
        }
        Err(_) => false,
    }
}
