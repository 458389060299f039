//! Graceful shutdown.
//!
//! A [`ShutdownController`] fans a single shutdown notification out to every
//! listener and then tears the registry down with `close_all()`, bounded by the
//! force timeout.

use crate::constants::DEFAULT_FORCE_TIMEOUT;
use crate::database::ConnectionRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Shutdown notification that can be awaited.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until shutdown has been requested.
    pub async fn recv(&mut self) {
        let _ = self.receiver.wait_for(|&v| v).await;
    }

    /// Check without waiting.
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Shutdown phases, broadcast as they start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Initiated,
    ClosingConnections,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Initiated => write!(f, "initiated"),
            ShutdownPhase::ClosingConnections => write!(f, "closing_connections"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Upper bound on closing every cached handle.
    pub force_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            force_timeout: DEFAULT_FORCE_TIMEOUT,
        }
    }
}

impl ShutdownConfig {
    /// Load from `MYSQL_SHUTDOWN_FORCE_TIMEOUT` (seconds, default 10).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(force) = std::env::var("MYSQL_SHUTDOWN_FORCE_TIMEOUT") {
            if let Ok(secs) = force.parse::<u64>() {
                config.force_timeout = Duration::from_secs(secs);
            }
        }

        config
    }
}

/// Coordinates process shutdown.
pub struct ShutdownController {
    sender: watch::Sender<bool>,
    shutting_down: AtomicBool,
    phase_sender: broadcast::Sender<ShutdownPhase>,
    force_timeout: Duration,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::with_config(ShutdownConfig::default())
    }

    pub fn with_config(config: ShutdownConfig) -> Self {
        let (sender, _) = watch::channel(false);
        let (phase_sender, _) = broadcast::channel(8);

        Self {
            sender,
            shutting_down: AtomicBool::new(false),
            phase_sender,
            force_timeout: config.force_timeout,
        }
    }

    /// A receiver that resolves once shutdown is requested.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscribe_phases(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.phase_sender.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn force_timeout(&self) -> Duration {
        self.force_timeout
    }

    /// Request shutdown. Only the first call has any effect.
    pub fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown...");
            let _ = self.sender.send(true);
            let _ = self.phase_sender.send(ShutdownPhase::Initiated);
        }
    }

    fn notify_phase(&self, phase: ShutdownPhase) {
        info!("Shutdown phase: {}", phase);
        let _ = self.phase_sender.send(phase);
    }

    /// Request shutdown and close every cached handle in `registry`.
    pub async fn graceful_shutdown(&self, registry: &ConnectionRegistry) {
        self.shutdown();

        self.notify_phase(ShutdownPhase::ClosingConnections);
        if tokio::time::timeout(self.force_timeout, registry.close_all())
            .await
            .is_err()
        {
            warn!(
                "Closing connections exceeded {:?}, abandoning remaining handles",
                self.force_timeout
            );
        }

        self.notify_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown complete");
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedShutdownController = Arc<ShutdownController>;

pub fn new_shutdown_controller(config: ShutdownConfig) -> SharedShutdownController {
    Arc::new(ShutdownController::with_config(config))
}

/// Trigger `controller` on Ctrl+C, and on SIGTERM where supported.
pub fn install_signal_handlers(controller: SharedShutdownController) {
    let ctrl_c_controller = controller.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                ctrl_c_controller.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl+C signal: {}", e),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown...");
                controller.shutdown();
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    });

    #[cfg(not(unix))]
    drop(controller);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigResolver, ConnectionProfile, RegistryConfig};
    use crate::database::{Connector, Session, SessionIdentity};
    use crate::error::ServerError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Sessions whose close never completes.
    struct HangingConnector;

    struct HangingSession;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self, _profile: &ConnectionProfile) -> Result<Box<dyn Session>, ServerError> {
            Ok(Box::new(HangingSession))
        }
    }

    #[async_trait]
    impl Session for HangingSession {
        async fn ping(&mut self) -> Result<(), ServerError> {
            Ok(())
        }

        async fn execute(&mut self, _sql: &str) -> Result<(), ServerError> {
            Ok(())
        }

        async fn session_identity(&mut self) -> Result<SessionIdentity, ServerError> {
            Ok(SessionIdentity::default())
        }

        async fn close(self: Box<Self>) -> Result<(), ServerError> {
            std::future::pending().await
        }
    }

    fn registry(dir: &TempDir) -> ConnectionRegistry {
        let resolver = ConfigResolver::new()
            .with_home_dir(dir.path())
            .with_project_dir(dir.path())
            .with_env(Vec::<(String, String)>::new());
        let config = RegistryConfig {
            close_timeout: Duration::from_secs(60),
            ..RegistryConfig::default()
        };
        ConnectionRegistry::new(resolver, Arc::new(HangingConnector), config)
    }

    #[test]
    fn test_shutdown_signal() {
        let controller = ShutdownController::new();
        let signal = controller.signal();
        assert!(!signal.is_shutdown());

        controller.shutdown();
        assert!(controller.is_shutting_down());
        assert!(signal.is_shutdown());

        // Second request is a no-op
        controller.shutdown();
        assert!(controller.is_shutting_down());
    }

    #[tokio::test]
    async fn test_signal_recv_wakes_waiter() {
        let controller = new_shutdown_controller(ShutdownConfig::default());
        let mut signal = controller.signal();

        let waiter = tokio::spawn(async move { signal.recv().await });
        controller.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_registry() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let controller = ShutdownController::new();
        let mut phases = controller.subscribe_phases();

        controller.graceful_shutdown(&registry).await;

        assert!(controller.is_shutting_down());
        assert_eq!(phases.recv().await.unwrap(), ShutdownPhase::Initiated);
        assert_eq!(phases.recv().await.unwrap(), ShutdownPhase::ClosingConnections);
        assert_eq!(phases.recv().await.unwrap(), ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn test_hung_close_bounded_by_force_timeout() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.get_handle(None).await.unwrap();

        let controller = ShutdownController::with_config(ShutdownConfig {
            force_timeout: Duration::from_millis(50),
        });

        tokio::time::timeout(Duration::from_secs(2), controller.graceful_shutdown(&registry))
            .await
            .expect("shutdown should not wait on a hung close");
    }

    #[test]
    fn test_shutdown_phase_display() {
        assert_eq!(ShutdownPhase::Initiated.to_string(), "initiated");
        assert_eq!(
            ShutdownPhase::ClosingConnections.to_string(),
            "closing_connections"
        );
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[test]
    fn test_shutdown_config_default() {
        assert_eq!(ShutdownConfig::default().force_timeout, Duration::from_secs(10));
    }
}
