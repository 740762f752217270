//! Health monitoring with bounded auto-recovery
//!
//! Each tick probes every running node concurrently: first the OS process, then
//! the control socket's `health` command. A node whose process has exited is
//! recovered right away; a live node is recovered after `failure_threshold`
//! consecutive failed probes. Recovery is capped by a per-node [`RestartBudget`]
//! over a trailing one-hour window. A node that exhausts its budget is stopped
//! and stays stopped until restarted manually.

use crate::supervisor::{MonitorHandle, NodeSupervisor, RECOVERY_STOP_TIMEOUT};
use chrono::{DateTime, Utc};
use conclave_core::config::HealthConfig;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Window the restart budget counts restarts over
pub const RESTART_WINDOW: Duration = Duration::from_secs(3600);

const RECOVERY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Health record of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl HealthStatus {
    fn healthy() -> Self {
        Self {
            healthy: true,
            last_check: Utc::now(),
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Restart timestamps of one node within the trailing window
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: usize,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(max_restarts: usize) -> Self {
        Self::with_window(max_restarts, RESTART_WINDOW)
    }

    pub fn with_window(max_restarts: usize, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            restarts: VecDeque::new(),
        }
    }

    /// Whether another restart fits in the window. Prunes expired entries.
    pub fn can_restart(&mut self) -> bool {
        self.prune();
        self.restarts.len() < self.max_restarts
    }

    /// Record a restart now
    pub fn record(&mut self) {
        self.restarts.push_back(Instant::now());
    }

    /// Restarts currently inside the window
    pub fn recent(&mut self) -> usize {
        self.prune();
        self.restarts.len()
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) >= self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Health records and restart budgets shared between the monitor loop and the supervisor
#[derive(Debug, Default)]
pub(crate) struct HealthState {
    statuses: RwLock<HashMap<String, HealthStatus>>,
    budgets: Mutex<HashMap<String, RestartBudget>>,
}

impl HealthState {
    pub(crate) async fn snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.statuses
            .read()
            .await
            .iter()
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect()
    }

    /// Drop a node's health record and restart budget
    pub(crate) async fn forget(&self, name: &str) {
        self.statuses.write().await.remove(name);
        self.budgets.lock().await.remove(name);
    }
}

/// Probes nodes and drives recovery through the supervisor
#[derive(Debug, Clone)]
pub(crate) struct HealthMonitor {
    supervisor: NodeSupervisor,
    config: HealthConfig,
    state: Arc<HealthState>,
}

impl HealthMonitor {
    pub(crate) fn with_state(
        supervisor: NodeSupervisor,
        config: HealthConfig,
        state: Arc<HealthState>,
    ) -> Self {
        Self {
            supervisor,
            config,
            state,
        }
    }

    /// Run the monitor loop in the background until the handle is cancelled
    pub(crate) fn spawn(supervisor: &NodeSupervisor, config: HealthConfig) -> MonitorHandle {
        let state = Arc::new(HealthState::default());
        let config_slot = config.clone();
        let token = CancellationToken::new();
        let weak = supervisor.downgrade();

        let task = tokio::spawn({
            let state = state.clone();
            let token = token.clone();
            async move {
                info!(
                    "Health monitor started (interval: {:?}, threshold: {})",
                    config.check_interval, config.failure_threshold
                );
                // A tick is never interrupted: cancelling mid-recovery would strand a
                // replacement process outside the node table.
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(config.check_interval) => {}
                    }
                    let Some(supervisor) = weak.upgrade() else {
                        break;
                    };
                    HealthMonitor::with_state(supervisor, config.clone(), state.clone())
                        .check_all()
                        .await;
                }
                info!("Health monitor stopped");
            }
        });

        MonitorHandle::new("health_monitor", token, task, Some((state, config_slot)))
    }

    /// Probe every running node concurrently and recover where needed
    pub(crate) async fn check_all(&self) {
        let names = self.supervisor.supervised_nodes().await;
        join_all(names.iter().map(|name| self.check_node(name))).await;
    }

    /// Probe one node and recover it if needed. Never fails; problems are recorded.
    async fn check_node(&self, name: &str) {
        let started = Instant::now();

        let exit = match self.supervisor.poll_process(name).await {
            // Not running any more; nothing to check
            None => return,
            Some(exit) => exit,
        };

        if let Some(exit) = exit {
            let message = format!("Process exited: {}", exit);
            warn!("Node {} is not alive: {}", name, message);
            self.record_failure(name, message).await;
            self.recover(name).await;
            return;
        }

        let probe = self
            .supervisor
            .client()
            .with_timeout(self.config.socket_timeout)
            .health_check(name)
            .await;
        self.supervisor
            .record_metric(
                self.supervisor
                    .metrics()
                    .observe_health_check(name, started.elapsed()),
            )
            .await;

        match probe {
            Ok(()) => {
                let mut statuses = self.state.statuses.write().await;
                let status = statuses
                    .entry(name.to_string())
                    .or_insert_with(HealthStatus::healthy);
                if !status.healthy {
                    info!("Node {} is healthy again", name);
                }
                *status = HealthStatus::healthy();
            }
            Err(e) => {
                let failures = self.record_failure(name, e.to_string()).await;
                warn!(
                    "Health check failed for node {} ({}/{}): {}",
                    name, failures, self.config.failure_threshold, e
                );
                if failures >= self.config.failure_threshold {
                    self.recover(name).await;
                }
            }
        }
    }

    async fn record_failure(&self, name: &str, message: String) -> u32 {
        self.supervisor
            .record_metric(self.supervisor.metrics().inc_health_check_failures(name))
            .await;

        let mut statuses = self.state.statuses.write().await;
        let status = statuses
            .entry(name.to_string())
            .or_insert_with(HealthStatus::healthy);
        status.healthy = false;
        status.last_check = Utc::now();
        status.consecutive_failures += 1;
        status.last_error = Some(message);
        status.consecutive_failures
    }

    async fn mark_unhealthy(&self, name: &str, message: String) {
        let mut statuses = self.state.statuses.write().await;
        let status = statuses
            .entry(name.to_string())
            .or_insert_with(HealthStatus::healthy);
        status.healthy = false;
        status.last_check = Utc::now();
        status.last_error = Some(message);
    }

    async fn recover(&self, name: &str) {
        let allowed = {
            let mut budgets = self.state.budgets.lock().await;
            let budget = budgets
                .entry(name.to_string())
                .or_insert_with(|| RestartBudget::new(self.config.max_restarts));
            if budget.can_restart() {
                budget.record();
                true
            } else {
                false
            }
        };

        if !allowed {
            let message = format!(
                "Restart budget exhausted ({} restarts within {:?}), node left stopped",
                self.config.max_restarts, RESTART_WINDOW
            );
            error!("Node {}: {}", name, message);
            if let Err(e) = self.supervisor.stop_node(name, RECOVERY_STOP_TIMEOUT).await {
                warn!("Failed to stop node {}: {}", name, e);
            }
            self.supervisor.set_last_error(name, message.clone()).await;
            self.mark_unhealthy(name, message).await;
            return;
        }

        warn!("Attempting recovery of node {}", name);
        match self
            .supervisor
            .recover_node(name, self.config.restart_delay)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Node {} left running state before recovery, skipping", name);
                return;
            }
            Err(e) => {
                error!("Recovery of node {} failed: {}", name, e);
                self.mark_unhealthy(name, format!("Recovery failed: {}", e))
                    .await;
                return;
            }
        }
        self.supervisor
            .record_metric(self.supervisor.metrics().inc_restarts(name, "health"))
            .await;

        let status = if self.await_socket(name).await {
            info!("Node {} recovered", name);
            self.supervisor.mark_ready(name).await;
            HealthStatus::healthy()
        } else {
            warn!(
                "Node {} restarted but its control socket did not answer within {:?}",
                name, self.config.recovery_window
            );
            self.supervisor.clear_ready(name).await;
            HealthStatus {
                healthy: false,
                last_check: Utc::now(),
                consecutive_failures: 0,
                last_error: Some(format!(
                    "Control socket did not answer within {:?} of restart",
                    self.config.recovery_window
                )),
            }
        };
        self.state
            .statuses
            .write()
            .await
            .insert(name.to_string(), status);
    }

    /// Poll the control socket until it answers or the recovery window closes
    async fn await_socket(&self, name: &str) -> bool {
        let deadline = Instant::now() + self.config.recovery_window;
        let client = self
            .supervisor
            .client()
            .with_timeout(self.config.socket_timeout);

        loop {
            if client.health_check(name).await.is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(RECOVERY_POLL_INTERVAL).await;
        }
    }
}
