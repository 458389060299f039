//! Sessions to MySQL targets and the handles that wrap them.

use crate::config::ConnectionProfile;
use crate::constants::{LIVENESS_PROBE_SQL, SESSION_IDENTITY_SQL};
use crate::error::ServerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Identity of the server-side session, as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionIdentity {
    pub current_database: Option<String>,
    pub current_user: Option<String>,
    pub server_host: Option<String>,
}

/// A live request/response session to one database target.
#[async_trait]
pub trait Session: Send {
    /// Minimal round trip.
    async fn ping(&mut self) -> Result<(), ServerError>;

    /// Run a statement, discarding any result set.
    async fn execute(&mut self, sql: &str) -> Result<(), ServerError>;

    /// Current database, user and server host of this session.
    async fn session_identity(&mut self) -> Result<SessionIdentity, ServerError>;

    /// Close the session.
    async fn close(self: Box<Self>) -> Result<(), ServerError>;
}

/// Creates sessions from connection profiles.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Box<dyn Session>, ServerError>;
}

/// Connector for real MySQL servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlConnector;

impl MySqlConnector {
    /// Driver options for a profile.
    pub fn opts(profile: &ConnectionProfile) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(profile.host.clone())
            .tcp_port(profile.port)
            .user(Some(profile.user.clone()))
            .pass(Some(profile.password.clone()))
            .db_name(profile.database.clone())
            .into()
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, profile: &ConnectionProfile) -> Result<Box<dyn Session>, ServerError> {
        debug!(profile = %profile.name, "Connecting to {}", profile.address());
        let conn = Conn::new(Self::opts(profile)).await?;
        Ok(Box::new(MySqlSession { conn }))
    }
}

/// A single `mysql_async` connection.
pub struct MySqlSession {
    conn: Conn,
}

#[async_trait]
impl Session for MySqlSession {
    async fn ping(&mut self) -> Result<(), ServerError> {
        self.conn.query_drop(LIVENESS_PROBE_SQL).await?;
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<(), ServerError> {
        self.conn.query_drop(sql).await?;
        Ok(())
    }

    async fn session_identity(&mut self) -> Result<SessionIdentity, ServerError> {
        let row: Option<(Option<String>, Option<String>, Option<String>)> =
            self.conn.query_first(SESSION_IDENTITY_SQL).await?;
        let (current_database, current_user, server_host) = row.unwrap_or_default();
        Ok(SessionIdentity {
            current_database,
            current_user,
            server_host,
        })
    }

    async fn close(self: Box<Self>) -> Result<(), ServerError> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

/// A live, reusable link to one profile's target.
///
/// Owned by the registry and shared with callers through `Arc`. Once closed,
/// every operation on the handle fails with a connection error.
///
/// Every operation bounds the wait for the session together with the network
/// call, so a caller holding [`ConnectionHandle::session`] can delay but never
/// wedge probes, status queries or close.
pub struct ConnectionHandle {
    id: u64,
    profile: String,
    created_at: DateTime<Utc>,
    query_timeout: Duration,
    closed: AtomicBool,
    session: Mutex<Option<Box<dyn Session>>>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: u64,
        profile: impl Into<String>,
        session: Box<dyn Session>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            id,
            profile: profile.into(),
            created_at: Utc::now(),
            query_timeout,
            closed: AtomicBool::new(false),
            session: Mutex::new(Some(session)),
        }
    }

    /// Registry-unique handle id. Distinct ids mean distinct sessions.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the owning profile.
    pub fn profile_name(&self) -> &str {
        &self.profile
    }

    /// When the underlying session was established.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Upper bound applied to [`ConnectionHandle::execute`].
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Exclusive access to the underlying session for issuing statements.
    ///
    /// Waiting for another caller's access is bounded by the query timeout.
    /// Statements issued on the guard are not; prefer
    /// [`ConnectionHandle::execute`]. Holds `None` once the handle has been
    /// closed.
    pub async fn session(&self) -> Result<MutexGuard<'_, Option<Box<dyn Session>>>, ServerError> {
        tokio::time::timeout(self.query_timeout, self.session.lock())
            .await
            .map_err(|_| ServerError::timeout("waiting for session", self.query_timeout.as_secs()))
    }

    /// Run a statement through this handle, bounded by the query timeout.
    pub async fn execute(&self, sql: &str) -> Result<(), ServerError> {
        let timeout = self.query_timeout;
        tokio::time::timeout(timeout, async {
            let mut guard = self.session.lock().await;
            let session = self.open_session(&mut guard)?;
            session.execute(sql).await
        })
        .await
        .map_err(|_| ServerError::timeout("query", timeout.as_secs()))?
    }

    /// Liveness probe bounded by `timeout`.
    pub async fn probe(&self, timeout: Duration) -> Result<(), ServerError> {
        tokio::time::timeout(timeout, async {
            let mut guard = self.session.lock().await;
            let session = self.open_session(&mut guard)?;
            session.ping().await
        })
        .await
        .map_err(|_| ServerError::timeout("liveness probe", timeout.as_secs()))?
    }

    /// Liveness probe that skips a session another caller is using.
    ///
    /// Returns `Ok(true)` when the session answered, `Ok(false)` when it is
    /// busy. A busy session was handed out and has not failed yet, so it counts
    /// as live.
    pub(crate) async fn probe_if_idle(&self, timeout: Duration) -> Result<bool, ServerError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let Ok(mut guard) = self.session.try_lock() else {
            return Ok(false);
        };
        let session = self.open_session(&mut guard)?;
        tokio::time::timeout(timeout, session.ping())
            .await
            .map_err(|_| ServerError::timeout("liveness probe", timeout.as_secs()))??;
        Ok(true)
    }

    /// Session identity query bounded by `timeout`.
    pub async fn identity(&self, timeout: Duration) -> Result<SessionIdentity, ServerError> {
        tokio::time::timeout(timeout, async {
            let mut guard = self.session.lock().await;
            let session = self.open_session(&mut guard)?;
            session.session_identity().await
        })
        .await
        .map_err(|_| ServerError::timeout("status query", timeout.as_secs()))?
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the underlying session, bounded by `timeout`. Idempotent.
    ///
    /// The handle is marked closed even when the wait for the session times
    /// out. The session is then dropped with the last reference to the handle.
    pub(crate) async fn close(&self, timeout: Duration) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tokio::time::timeout(timeout, async {
            let session = self.session.lock().await.take();
            match session {
                Some(session) => session
                    .close()
                    .await
                    .map_err(|e| ServerError::close(&self.profile, e.to_string())),
                None => Ok(()),
            }
        })
        .await
        .map_err(|_| ServerError::close(&self.profile, "close timed out"))?
    }

    fn open_session<'a>(
        &self,
        guard: &'a mut MutexGuard<'_, Option<Box<dyn Session>>>,
    ) -> Result<&'a mut Box<dyn Session>, ServerError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        guard.as_mut().ok_or_else(|| self.closed_error())
    }

    fn closed_error(&self) -> ServerError {
        ServerError::connection(format!(
            "handle {} for '{}' is closed",
            self.id, self.profile
        ))
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("profile", &self.profile)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    struct StubSession {
        alive: Arc<AtomicBool>,
        slow: bool,
    }

    /// Accepts statements but never answers them.
    struct StalledSession;

    #[async_trait]
    impl Session for StubSession {
        async fn ping(&mut self) -> Result<(), ServerError> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.alive.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ServerError::connection("server has gone away"))
            }
        }

        async fn execute(&mut self, _sql: &str) -> Result<(), ServerError> {
            self.ping().await
        }

        async fn session_identity(&mut self) -> Result<SessionIdentity, ServerError> {
            Ok(SessionIdentity {
                current_database: Some("testdb".into()),
                current_user: Some("root@localhost".into()),
                server_host: Some("db1".into()),
            })
        }

        async fn close(self: Box<Self>) -> Result<(), ServerError> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn handle(slow: bool) -> (ConnectionHandle, Arc<AtomicBool>) {
        let alive = Arc::new(AtomicBool::new(true));
        let session = StubSession {
            alive: alive.clone(),
            slow,
        };
        let handle = ConnectionHandle::new(1, "dev", Box::new(session), Duration::from_secs(1));
        (handle, alive)
    }

    #[async_trait]
    impl Session for StalledSession {
        async fn ping(&mut self) -> Result<(), ServerError> {
            Ok(())
        }

        async fn execute(&mut self, _sql: &str) -> Result<(), ServerError> {
            std::future::pending().await
        }

        async fn session_identity(&mut self) -> Result<SessionIdentity, ServerError> {
            Ok(SessionIdentity::default())
        }

        async fn close(self: Box<Self>) -> Result<(), ServerError> {
            Ok(())
        }
    }

    #[test]
    fn test_mysql_opts_from_profile() {
        let profile = ConnectionProfile {
            name: "dev".into(),
            host: "db.internal".into(),
            port: 3307,
            user: "app".into(),
            password: "secret".into(),
            database: Some("shop".into()),
            description: None,
            environment: None,
        };
        let opts = MySqlConnector::opts(&profile);
        assert_eq!(opts.ip_or_hostname(), "db.internal");
        assert_eq!(opts.tcp_port(), 3307);
        assert_eq!(opts.user(), Some("app"));
        assert_eq!(opts.db_name(), Some("shop"));
    }

    #[tokio::test]
    async fn test_probe_reports_dead_session() {
        let (handle, alive) = handle(false);
        assert_ok!(handle.probe(Duration::from_secs(1)).await);

        alive.store(false, Ordering::SeqCst);
        assert_err!(handle.probe(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let (handle, _alive) = handle(true);
        let err = handle.probe(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ServerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_use() {
        let (handle, alive) = handle(false);
        handle.close(Duration::from_secs(1)).await.unwrap();
        assert!(!alive.load(Ordering::SeqCst));
        assert!(handle.is_closed());
        assert_err!(handle.execute("SELECT 1").await);

        // Closing twice is a no-op
        assert_ok!(handle.close(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_identity() {
        let (handle, _alive) = handle(false);
        let identity = handle.identity(Duration::from_secs(1)).await.unwrap();
        assert_eq!(identity.current_database.as_deref(), Some("testdb"));
        assert_eq!(identity.server_host.as_deref(), Some("db1"));
    }

    #[tokio::test]
    async fn test_execute_bounded_by_query_timeout() {
        let handle = ConnectionHandle::new(
            7,
            "dev",
            Box::new(StalledSession),
            Duration::from_millis(50),
        );

        let err = tokio::time::timeout(Duration::from_secs(2), handle.execute("SELECT SLEEP(60)"))
            .await
            .expect("execute must not outlive its query timeout")
            .unwrap_err();
        assert!(matches!(err, ServerError::Timeout { ref operation, .. } if operation == "query"));

        // The stalled statement released the session when it was abandoned
        assert_ok!(handle.probe(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_operations_bounded_while_session_held() {
        let (handle, _alive) = handle(false);
        let guard = handle.session().await.unwrap();

        let err = handle.probe(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ServerError::Timeout { .. }));
        assert_err!(handle.identity(Duration::from_millis(20)).await);
        assert_err!(handle.execute("SELECT 1").await);
        assert!(!handle.probe_if_idle(Duration::from_millis(20)).await.unwrap());

        let err = tokio::time::timeout(Duration::from_secs(2), handle.close(Duration::from_millis(20)))
            .await
            .expect("close must not wait on a held session")
            .unwrap_err();
        assert!(matches!(err, ServerError::Close { .. }));
        assert!(handle.is_closed());

        drop(guard);
        assert_err!(handle.probe(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_if_idle_pings_free_session() {
        let (handle, alive) = handle(false);
        assert!(handle.probe_if_idle(Duration::from_secs(1)).await.unwrap());

        alive.store(false, Ordering::SeqCst);
        assert_err!(handle.probe_if_idle(Duration::from_secs(1)).await);
    }
}
