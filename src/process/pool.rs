//! One [`ProcessConnection`] per catalog process, created on first use.

use crate::catalog::Catalog;
use crate::error::{AppError, Result};
use crate::process::connection::ProcessConnection;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Outcome of [`ConnectionPool::shutdown_all`].
#[derive(Debug, Default, Serialize)]
pub struct ShutdownReport {
    /// Processes that stopped cleanly
    pub terminated: Vec<String>,
    /// Processes whose termination failed, with the reason
    pub failures: Vec<(String, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ConnectionPool {
    catalog: Arc<Catalog>,
    terminate_grace: Duration,
    connections: Mutex<HashMap<String, Arc<ProcessConnection>>>,
}

impl ConnectionPool {
    pub fn new(catalog: Arc<Catalog>, terminate_grace: Duration) -> Self {
        Self {
            catalog,
            terminate_grace,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The connection for `process_name`, created (not spawned) on first
    /// request. Concurrent callers for the same name get the same instance.
    pub async fn get_or_create(&self, process_name: &str) -> Result<Arc<ProcessConnection>> {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(process_name) {
            return Ok(Arc::clone(conn));
        }

        let spec = self
            .catalog
            .process(process_name)
            .ok_or_else(|| AppError::UnknownProcessError(process_name.to_string()))?;

        let conn = Arc::new(ProcessConnection::from_spec(spec, self.terminate_grace));
        connections.insert(process_name.to_string(), Arc::clone(&conn));
        tracing::debug!(process = process_name, "Connection registered");

        Ok(conn)
    }

    /// The existing connection, if one was ever requested.
    pub async fn get(&self, process_name: &str) -> Option<Arc<ProcessConnection>> {
        self.connections.lock().await.get(process_name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Call `tool_name` on `process_name`, spawning the process if needed.
    pub async fn execute(
        &self,
        process_name: &str,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<Value> {
        self.execute_with_timeout(process_name, tool_name, arguments, None)
            .await
    }

    pub async fn execute_with_timeout(
        &self,
        process_name: &str,
        tool_name: &str,
        arguments: &Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        // Map lock is released here; only the connection's own lock is held
        // for the duration of the call.
        let conn = self.get_or_create(process_name).await?;
        match timeout {
            Some(limit) => conn.call_with_timeout(tool_name, arguments, limit).await,
            None => conn.call(tool_name, arguments).await,
        }
    }

    /// Terminate every connection in parallel and empty the pool.
    ///
    /// Failures are collected rather than returned early so one stuck
    /// process does not keep the others alive.
    pub async fn shutdown_all(&self) -> ShutdownReport {
        let drained: Vec<Arc<ProcessConnection>> = {
            let mut connections = self.connections.lock().await;
            connections.drain().map(|(_, conn)| conn).collect()
        };

        let mut tasks = JoinSet::new();
        for conn in drained {
            tasks.spawn(async move {
                let name = conn.process_name().to_string();
                (name, conn.terminate().await)
            });
        }

        let mut report = ShutdownReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => report.terminated.push(name),
                Ok((name, Err(e))) => {
                    tracing::warn!(process = %name, error = %e, "Failed to terminate process");
                    report.failures.push((name, e.to_string()));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Terminate task panicked");
                    report.failures.push(("<unknown>".to_string(), e.to_string()));
                }
            }
        }

        report.terminated.sort();
        tracing::info!(
            terminated = report.terminated.len(),
            failed = report.failures.len(),
            "Connection pool shut down"
        );
        report
    }
}
