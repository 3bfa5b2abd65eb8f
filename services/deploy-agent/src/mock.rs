//! Scripted transport for tests and local development.
//!
//! Every command and upload is recorded. Commands containing a configured
//! substring exit with status 1, and connections can be refused outright.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canopy_ledger::ServerRecord;
use tracing::{debug, info};

use crate::transport::{Connector, ExecOutput, RemoteSession, TransportError};

#[derive(Default)]
struct MockState {
    refuse_connections: AtomicBool,
    fail_on: Mutex<Vec<String>>,
    exec_delay: Mutex<Duration>,
    executed: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl MockState {
    fn fails(&self, line: &str) -> bool {
        self.fail_on
            .lock()
            .map(|patterns| patterns.iter().any(|p| line.contains(p.as_str())))
            .unwrap_or(false)
    }

    fn record(&self, line: String) {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(line);
        }
    }

    fn delay(&self) -> Duration {
        self.exec_delay.lock().map(|d| *d).unwrap_or_default()
    }
}

/// Mock connector. Clones share state.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    /// Create a connector whose sessions accept every command.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) every new connection.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make any command or upload containing `pattern` fail.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        if let Ok(mut patterns) = self.state.fail_on.lock() {
            patterns.push(pattern.into());
        }
    }

    /// Stop failing anything.
    pub fn clear_failures(&self) {
        if let Ok(mut patterns) = self.state.fail_on.lock() {
            patterns.clear();
        }
    }

    /// Sleep this long inside every command.
    pub fn set_exec_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.state.exec_delay.lock() {
            *d = delay;
        }
    }

    /// Commands and uploads run so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state
            .executed
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, server: &ServerRecord) -> Result<Arc<dyn RemoteSession>, TransportError> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                target: server.ip.clone(),
                reason: "[MOCK] connection refused".to_string(),
            });
        }

        self.state.opened.fetch_add(1, Ordering::SeqCst);
        info!(target = %server.ip, "[MOCK] Session opened");
        Ok(Arc::new(MockSession {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl MockSession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput, TransportError> {
        self.ensure_open()?;
        let delay = self.state.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.state.record(command.to_string());
        if self.state.fails(command) {
            debug!(command, "[MOCK] Command failing");
            return Ok(ExecOutput {
                exit_status: Some(1),
                stdout: String::new(),
                stderr: format!("[MOCK] {command} failed"),
            });
        }

        Ok(ExecOutput {
            exit_status: Some(0),
            ..Default::default()
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let line = format!("upload {} -> {}", local.display(), remote);
        self.state.record(line.clone());
        if self.state.fails(&line) {
            return Err(TransportError::Upload {
                local: local.display().to_string(),
                remote: remote.to_string(),
                reason: "[MOCK] upload failed".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
